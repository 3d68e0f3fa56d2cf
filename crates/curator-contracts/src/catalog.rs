use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetCategory {
    #[serde(alias = "backgrounds")]
    Background,
    #[serde(alias = "buttons")]
    Button,
    #[serde(alias = "icons")]
    Icon,
    #[serde(alias = "frames")]
    Frame,
    #[serde(alias = "cosmetic-previews", alias = "cosmetic_preview")]
    CosmeticPreview,
    #[serde(alias = "text-overlays", alias = "text_overlay")]
    TextOverlay,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 6] = [
        AssetCategory::Background,
        AssetCategory::Button,
        AssetCategory::Icon,
        AssetCategory::Frame,
        AssetCategory::CosmeticPreview,
        AssetCategory::TextOverlay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AssetCategory::Background => "background",
            AssetCategory::Button => "button",
            AssetCategory::Icon => "icon",
            AssetCategory::Frame => "frame",
            AssetCategory::CosmeticPreview => "cosmetic-preview",
            AssetCategory::TextOverlay => "text-overlay",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        let normalized = normalized.trim_end_matches('s');
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
    }

    /// Output sub-directory under `<out>/assets/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            AssetCategory::Background => "backgrounds",
            AssetCategory::Button => "buttons",
            AssetCategory::Icon => "icons",
            AssetCategory::Frame => "frames",
            AssetCategory::CosmeticPreview => "cosmetics",
            AssetCategory::TextOverlay => "overlays",
        }
    }

    /// Full-frame backgrounds stay opaque; every other class is cut out.
    pub fn requires_transparency(self) -> bool {
        !matches!(self, AssetCategory::Background)
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" | "med" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub id: String,
    pub category: AssetCategory,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub target_size: Option<String>,
    pub priority: Priority,
    pub file: Option<String>,
}

impl AssetDescriptor {
    pub fn new(id: impl Into<String>, category: AssetCategory, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category,
            prompt: prompt.into(),
            negative_prompt: None,
            target_size: None,
            priority: Priority::default(),
            file: None,
        }
    }

    pub fn file_name(&self) -> String {
        match self.file.as_deref().map(str::trim) {
            Some(file) if !file.is_empty() => {
                if Path::new(file).extension().is_some() {
                    file.to_string()
                } else {
                    format!("{file}.png")
                }
            }
            _ => format!("{}.png", self.id),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("catalog {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("duplicate asset id '{0}'")]
    DuplicateId(String),
    #[error("asset '{0}' has an empty id or prompt")]
    EmptyField(String),
    #[error("asset '{id}' has invalid size '{size}' (expected WxH)")]
    InvalidSize { id: String, size: String },
    #[error("reference image not found: {}", .0.display())]
    MissingReference(PathBuf),
    #[error("unknown asset id '{0}' requested")]
    UnknownId(String),
    #[error("asset '{id}' has unsafe {field} '{value}' (path separators and '..' are not allowed)")]
    UnsafeName {
        id: String,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    style_guide: Option<String>,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    assets: IndexMap<AssetCategory, Vec<AssetEntry>>,
}

#[derive(Debug, Deserialize)]
struct AssetEntry {
    id: String,
    prompt: String,
    #[serde(default, alias = "negativePrompt")]
    negative_prompt: Option<String>,
    #[serde(default, alias = "targetSize", alias = "target_size")]
    size: Option<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    file: Option<String>,
}

/// Declarative list of required assets, loaded once per run and never written.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub style_guide: Option<String>,
    pub references: Vec<PathBuf>,
    assets: IndexMap<String, AssetDescriptor>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let catalog = Self::parse(&raw, base_dir).map_err(|err| match err {
            CatalogError::Parse { source, .. } => CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        for reference in &catalog.references {
            if !reference.is_file() {
                return Err(CatalogError::MissingReference(reference.clone()));
            }
        }
        Ok(catalog)
    }

    /// Parses catalog JSON; relative reference paths resolve against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw).map_err(|source| CatalogError::Parse {
            path: PathBuf::new(),
            source,
        })?;

        let mut assets = IndexMap::new();
        for (category, entries) in file.assets {
            for entry in entries {
                let descriptor = descriptor_from_entry(category, entry)?;
                if assets.contains_key(&descriptor.id) {
                    return Err(CatalogError::DuplicateId(descriptor.id));
                }
                assets.insert(descriptor.id.clone(), descriptor);
            }
        }

        let references = file
            .references
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| {
                let path = PathBuf::from(value);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            })
            .collect();

        Ok(Self {
            style_guide: file
                .style_guide
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            references,
            assets,
        })
    }

    pub fn get(&self, id: &str) -> Option<&AssetDescriptor> {
        self.assets.get(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetDescriptor> {
        self.assets.values()
    }

    /// Returns owned copies in run order: priority first, catalog order within a priority.
    pub fn select(&self, filter: &CatalogFilter) -> Result<Vec<AssetDescriptor>, CatalogError> {
        for id in &filter.ids {
            if !self.assets.contains_key(id) {
                return Err(CatalogError::UnknownId(id.clone()));
            }
        }
        let mut selected = self
            .assets
            .values()
            .filter(|asset| filter.matches(asset))
            .cloned()
            .collect::<Vec<AssetDescriptor>>();
        selected.sort_by_key(|asset| asset.priority);
        Ok(selected)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub ids: Vec<String>,
    pub categories: Vec<AssetCategory>,
    pub priorities: Vec<Priority>,
}

impl CatalogFilter {
    pub fn matches(&self, asset: &AssetDescriptor) -> bool {
        (self.ids.is_empty() || self.ids.iter().any(|id| id == &asset.id))
            && (self.categories.is_empty() || self.categories.contains(&asset.category))
            && (self.priorities.is_empty() || self.priorities.contains(&asset.priority))
    }
}

fn descriptor_from_entry(
    category: AssetCategory,
    entry: AssetEntry,
) -> Result<AssetDescriptor, CatalogError> {
    let id = entry.id.trim().to_string();
    let prompt = entry.prompt.trim().to_string();
    if id.is_empty() || prompt.is_empty() {
        let label = if id.is_empty() { "<unnamed>".to_string() } else { id };
        return Err(CatalogError::EmptyField(label));
    }
    ensure_plain_name(&id, "id", &id)?;
    if let Some(file) = &entry.file {
        ensure_plain_name(&id, "file", file)?;
    }
    let target_size = entry
        .size
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty());
    if let Some(size) = &target_size {
        if parse_size(size).is_none() {
            return Err(CatalogError::InvalidSize {
                id,
                size: size.clone(),
            });
        }
    }
    Ok(AssetDescriptor {
        id,
        category,
        prompt,
        negative_prompt: entry
            .negative_prompt
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        target_size,
        priority: entry.priority,
        file: entry.file,
    })
}

// Ids and file names become single path components under the output root.
fn ensure_plain_name(id: &str, field: &'static str, value: &str) -> Result<(), CatalogError> {
    if value.contains(['/', '\\']) || value.contains("..") {
        return Err(CatalogError::UnsafeName {
            id: id.to_string(),
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Parses `"WxH"` into non-zero dimensions.
pub fn parse_size(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().to_ascii_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().parse::<u32>().ok(), h.trim().parse::<u32>().ok())
    })?;
    match (w?, h?) {
        (0, _) | (_, 0) => None,
        dims => Some(dims),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{parse_size, AssetCategory, Catalog, CatalogError, CatalogFilter, Priority};

    const SAMPLE: &str = r#"{
        "style_guide": "Cozy hand-painted fantasy, warm palette",
        "references": ["refs/hero.png"],
        "assets": {
            "icons": [
                {"id": "coin", "prompt": "gold coin icon", "priority": "low"},
                {"id": "gem", "prompt": "blue gem icon", "negative_prompt": "text, watermark", "priority": "high"}
            ],
            "background": [
                {"id": "forest", "prompt": "misty forest", "size": "1536x1024", "file": "forest_bg"}
            ],
            "cosmetic_preview": [
                {"id": "hat", "prompt": "wizard hat"}
            ]
        }
    }"#;

    #[test]
    fn parse_assigns_category_from_group() -> anyhow::Result<()> {
        let catalog = Catalog::parse(SAMPLE, Path::new("/catalogs"))?;
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.get("coin").map(|a| a.category), Some(AssetCategory::Icon));
        assert_eq!(
            catalog.get("forest").map(|a| a.category),
            Some(AssetCategory::Background)
        );
        assert_eq!(
            catalog.get("hat").map(|a| a.category),
            Some(AssetCategory::CosmeticPreview)
        );
        assert_eq!(
            catalog.get("gem").and_then(|a| a.negative_prompt.as_deref()),
            Some("text, watermark")
        );
        assert_eq!(catalog.references[0], Path::new("/catalogs/refs/hero.png"));
        assert_eq!(
            catalog.style_guide.as_deref(),
            Some("Cozy hand-painted fantasy, warm palette")
        );
        Ok(())
    }

    #[test]
    fn file_name_defaults_to_id_and_adds_extension() -> anyhow::Result<()> {
        let catalog = Catalog::parse(SAMPLE, Path::new("."))?;
        assert_eq!(catalog.get("coin").map(|a| a.file_name()), Some("coin.png".to_string()));
        assert_eq!(
            catalog.get("forest").map(|a| a.file_name()),
            Some("forest_bg.png".to_string())
        );
        Ok(())
    }

    #[test]
    fn duplicate_ids_across_groups_are_rejected() {
        let raw = r#"{"assets": {
            "icon": [{"id": "x", "prompt": "a"}],
            "frame": [{"id": "x", "prompt": "b"}]
        }}"#;
        let err = Catalog::parse(raw, Path::new(".")).err();
        assert!(matches!(err, Some(CatalogError::DuplicateId(id)) if id == "x"));
    }

    #[test]
    fn empty_prompt_and_bad_size_are_rejected() {
        let empty = r#"{"assets": {"icon": [{"id": "x", "prompt": "  "}]}}"#;
        assert!(matches!(
            Catalog::parse(empty, Path::new(".")),
            Err(CatalogError::EmptyField(_))
        ));
        let bad_size = r#"{"assets": {"icon": [{"id": "x", "prompt": "a", "size": "big"}]}}"#;
        assert!(matches!(
            Catalog::parse(bad_size, Path::new(".")),
            Err(CatalogError::InvalidSize { .. })
        ));
    }

    #[test]
    fn ids_and_files_that_escape_the_output_tree_are_rejected() {
        for raw in [
            r#"{"assets": {"icon": [{"id": "coin", "prompt": "a", "file": "../../x.png"}]}}"#,
            r#"{"assets": {"icon": [{"id": "coin", "prompt": "a", "file": "/tmp/x.png"}]}}"#,
            r#"{"assets": {"icon": [{"id": "a/b", "prompt": "a"}]}}"#,
            r#"{"assets": {"icon": [{"id": "a\\b", "prompt": "a"}]}}"#,
            r#"{"assets": {"icon": [{"id": "..", "prompt": "a"}]}}"#,
        ] {
            assert!(
                matches!(
                    Catalog::parse(raw, Path::new(".")),
                    Err(CatalogError::UnsafeName { .. })
                ),
                "accepted {raw}"
            );
        }
        let plain = r#"{"assets": {"icon": [{"id": "coin-2", "prompt": "a", "file": "coin_v2.png"}]}}"#;
        assert!(Catalog::parse(plain, Path::new(".")).is_ok());
    }

    #[test]
    fn select_orders_by_priority_then_catalog_order() -> anyhow::Result<()> {
        let catalog = Catalog::parse(SAMPLE, Path::new("."))?;
        let ids = catalog
            .select(&CatalogFilter::default())?
            .into_iter()
            .map(|asset| asset.id)
            .collect::<Vec<String>>();
        assert_eq!(ids, vec!["gem", "forest", "hat", "coin"]);
        Ok(())
    }

    #[test]
    fn select_applies_filters_and_rejects_unknown_ids() -> anyhow::Result<()> {
        let catalog = Catalog::parse(SAMPLE, Path::new("."))?;
        let icons = catalog.select(&CatalogFilter {
            categories: vec![AssetCategory::Icon],
            priorities: vec![Priority::Low],
            ..CatalogFilter::default()
        })?;
        assert_eq!(icons.len(), 1);
        assert_eq!(icons[0].id, "coin");

        let missing = catalog.select(&CatalogFilter {
            ids: vec!["nope".to_string()],
            ..CatalogFilter::default()
        });
        assert!(matches!(missing, Err(CatalogError::UnknownId(_))));
        Ok(())
    }

    #[test]
    fn load_reports_missing_reference_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("catalog.json");
        std::fs::write(&path, SAMPLE)?;
        assert!(matches!(
            Catalog::load(&path),
            Err(CatalogError::MissingReference(_))
        ));

        std::fs::create_dir_all(temp.path().join("refs"))?;
        std::fs::write(temp.path().join("refs/hero.png"), b"png")?;
        assert_eq!(Catalog::load(&path)?.len(), 4);
        Ok(())
    }

    #[test]
    fn category_and_size_parsing() {
        assert_eq!(AssetCategory::parse("Icons"), Some(AssetCategory::Icon));
        assert_eq!(
            AssetCategory::parse("text_overlay"),
            Some(AssetCategory::TextOverlay)
        );
        assert_eq!(AssetCategory::parse("sprite"), None);
        assert!(!AssetCategory::Background.requires_transparency());
        assert!(AssetCategory::Frame.requires_transparency());
        assert_eq!(parse_size("1536x1024"), Some((1536, 1024)));
        assert_eq!(parse_size("0x10"), None);
        assert_eq!(parse_size("wide"), None);
    }
}
