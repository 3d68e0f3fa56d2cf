use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use curator_contracts::catalog::AssetDescriptor;
use image::{ImageFormat, RgbaImage};

/// Layout of a run's output directory.
///
/// ```text
/// <root>/assets/<category dir>/<file>.png
/// <root>/receipts/<id>-iter-<n>.json
/// <root>/sessions/<id>.json
/// <root>/events.jsonl
/// <root>/summary.json
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn asset_path(&self, asset: &AssetDescriptor) -> PathBuf {
        self.root
            .join("assets")
            .join(asset.category.dir_name())
            .join(asset.file_name())
    }

    pub fn receipt_path(&self, asset_id: &str, iteration: u32) -> PathBuf {
        self.root
            .join("receipts")
            .join(format!("{asset_id}-iter-{iteration}.json"))
    }

    pub fn session_path(&self, asset_id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{asset_id}.json"))
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    /// Writes the asset as PNG; later iterations overwrite earlier ones.
    pub fn write_image(&self, asset: &AssetDescriptor, image: &RgbaImage) -> Result<PathBuf> {
        let path = self.asset_path(asset);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        image
            .save_with_format(&path, ImageFormat::Png)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use curator_contracts::catalog::{AssetCategory, AssetDescriptor};
    use image::{Rgba, RgbaImage};

    use super::ArtifactStore;

    #[test]
    fn paths_follow_category_layout() {
        let store = ArtifactStore::new("/out");
        let mut asset = AssetDescriptor::new("play", AssetCategory::Button, "play button");
        assert_eq!(
            store.asset_path(&asset).to_string_lossy(),
            "/out/assets/buttons/play.png"
        );
        asset.file = Some("btn_play.png".to_string());
        assert_eq!(
            store.asset_path(&asset).to_string_lossy(),
            "/out/assets/buttons/btn_play.png"
        );
        assert_eq!(
            store.receipt_path("play", 2).to_string_lossy(),
            "/out/receipts/play-iter-2.json"
        );
        assert_eq!(
            store.session_path("play").to_string_lossy(),
            "/out/sessions/play.json"
        );
    }

    #[test]
    fn write_image_overwrites_previous_iteration() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let asset = AssetDescriptor::new("gem", AssetCategory::Icon, "gem");

        store.write_image(&asset, &RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])))?;
        let path = store.write_image(&asset, &RgbaImage::from_pixel(6, 3, Rgba([9, 9, 9, 0])))?;

        let saved = image::open(&path)?.to_rgba8();
        assert_eq!(saved.dimensions(), (6, 3));
        assert_eq!(saved.get_pixel(0, 0)[3], 0);
        Ok(())
    }
}
