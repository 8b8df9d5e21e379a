// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-catalog
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Persona and mission catalog: document discovery across configured
//! directories, YAML frontmatter parsing, and `extends`-chain resolution
//! with cycle detection. Persona/mission documents are markdown files with
//! a frontmatter header; missions additionally bind an execution mode, a
//! prompt template, and a report schema.

/// Frontmatter parsing helpers.
pub mod frontmatter;

use frontmatter::{optional_bool, optional_str, optional_string_list, parse_frontmatter, require_str};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Catalog config schema version this crate understands.
pub const CATALOG_VERSION: u64 = 1;

/// The closed set of supported execution modes.
pub const ALLOWED_EXECUTION_MODES: &[&str] = &["single_pass_inline_report"];

/// Target-side overlay location, relative to the target repo root.
pub const TARGET_OVERLAY_REL: &str = ".usertest/catalog.yaml";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Catalog failure with an optional stable code and structured details.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CatalogError {
    /// Human-readable description.
    pub message: String,
    /// Stable machine code (e.g. `duplicate_persona_id`).
    pub code: Option<String>,
    /// Structured context (e.g. both offending paths).
    pub details: BTreeMap<String, serde_json::Value>,
}

impl CatalogError {
    /// Error without a machine code.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: BTreeMap::new(),
        }
    }

    /// Error with a machine code.
    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.to_string()),
            details: BTreeMap::new(),
        }
    }

    /// Attach a detail value.
    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.to_string(), v);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// A persona document (possibly unresolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaSpec {
    /// Unique id across all persona directories.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Base persona this one extends, if any.
    pub extends: Option<String>,
    /// Markdown body (after resolution: base bodies prepended).
    pub body_md: String,
    /// Where the document was discovered.
    pub source_path: PathBuf,
}

/// A mission document (possibly unresolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    /// Unique id across all mission directories.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Base mission this one extends, if any.
    pub extends: Option<String>,
    /// Tags, union-merged base→derived preserving first-seen order.
    pub tags: Vec<String>,
    /// Execution mode; inherited from base when absent.
    pub execution_mode: String,
    /// Prompt template name; inherited from base when absent.
    pub prompt_template: String,
    /// Report schema name; inherited from base when absent.
    pub report_schema: String,
    /// Markdown body.
    pub body_md: String,
    /// Where the document was discovered.
    pub source_path: PathBuf,
    /// Whether the mission needs shell access.
    pub requires_shell: bool,
    /// Whether the mission needs file edits.
    pub requires_edits: bool,
}

/// Merged catalog configuration (base config plus optional target overlay).
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    /// Schema version; must equal [`CATALOG_VERSION`].
    pub version: u64,
    /// Directories scanned for `*.persona.md`.
    pub personas_dirs: Vec<PathBuf>,
    /// Directories scanned for `*.mission.md`.
    pub missions_dirs: Vec<PathBuf>,
    /// Directory holding prompt templates.
    pub prompt_templates_dir: PathBuf,
    /// Directory holding report schemas.
    pub report_schemas_dir: PathBuf,
    /// Default persona id, if configured.
    pub defaults_persona_id: Option<String>,
    /// Default mission id, if configured.
    pub defaults_mission_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCatalogFile {
    version: Option<u64>,
    #[serde(default)]
    personas_dirs: Vec<String>,
    #[serde(default)]
    missions_dirs: Vec<String>,
    prompt_templates_dir: Option<String>,
    report_schemas_dir: Option<String>,
    defaults: Option<RawDefaults>,
    #[allow(dead_code)]
    meta: Option<serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    persona_id: Option<String>,
    mission_id: Option<String>,
    #[allow(dead_code)]
    meta: Option<serde_yaml::Value>,
}

fn load_catalog_file(path: &Path) -> Result<RawCatalogFile, CatalogError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CatalogError::invalid(format!("Failed to read {}: {e}", path.display())))?;
    serde_yaml::from_str(&text)
        .map_err(|e| CatalogError::invalid(format!("Failed to parse YAML in {}: {e}", path.display())))
}

fn resolve_dirs(root: &Path, rels: &[String]) -> Vec<PathBuf> {
    rels.iter()
        .map(|rel| {
            let raw = PathBuf::from(rel);
            if raw.is_absolute() { raw } else { root.join(raw) }
        })
        .collect()
}

fn clean_id(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Load the base catalog config (`<repo_root>/configs/catalog.yaml`) and,
/// when a target repo is given and carries `.usertest/catalog.yaml`, append
/// its persona/mission dirs and let its defaults override.
pub fn load_catalog_config(
    repo_root: &Path,
    target_repo_root: Option<&Path>,
) -> Result<CatalogConfig, CatalogError> {
    let base_path = repo_root.join("configs").join("catalog.yaml");
    let base = load_catalog_file(&base_path)?;

    let version = base.version.ok_or_else(|| {
        CatalogError::invalid(format!("Missing required version in {}.", base_path.display()))
    })?;
    if version != CATALOG_VERSION {
        return Err(CatalogError::invalid(format!(
            "Unsupported catalog version {version} in {}.",
            base_path.display()
        )));
    }

    let prompt_templates_dir = base.prompt_templates_dir.ok_or_else(|| {
        CatalogError::invalid(format!(
            "Missing required prompt_templates_dir in {}.",
            base_path.display()
        ))
    })?;
    let report_schemas_dir = base.report_schemas_dir.ok_or_else(|| {
        CatalogError::invalid(format!(
            "Missing required report_schemas_dir in {}.",
            base_path.display()
        ))
    })?;

    let base_defaults = base.defaults.unwrap_or_default();
    let mut merged = CatalogConfig {
        version,
        personas_dirs: resolve_dirs(repo_root, &base.personas_dirs),
        missions_dirs: resolve_dirs(repo_root, &base.missions_dirs),
        prompt_templates_dir: resolve_dirs(repo_root, &[prompt_templates_dir])
            .remove(0),
        report_schemas_dir: resolve_dirs(repo_root, &[report_schemas_dir]).remove(0),
        defaults_persona_id: clean_id(base_defaults.persona_id),
        defaults_mission_id: clean_id(base_defaults.mission_id),
    };

    let Some(target_root) = target_repo_root else {
        return Ok(merged);
    };
    let overlay_path = target_root.join(TARGET_OVERLAY_REL);
    if !overlay_path.exists() {
        return Ok(merged);
    }

    tracing::debug!(path = %overlay_path.display(), "applying target catalog overlay");
    let overlay = load_catalog_file(&overlay_path)?;
    if let Some(overlay_version) = overlay.version {
        if overlay_version != merged.version {
            return Err(CatalogError::invalid(format!(
                "Catalog version mismatch: base={} ({}), target={overlay_version} ({}).",
                merged.version,
                base_path.display(),
                overlay_path.display()
            )));
        }
    }

    merged
        .personas_dirs
        .extend(resolve_dirs(target_root, &overlay.personas_dirs));
    merged
        .missions_dirs
        .extend(resolve_dirs(target_root, &overlay.missions_dirs));
    if let Some(dir) = overlay.prompt_templates_dir {
        merged.prompt_templates_dir = resolve_dirs(target_root, &[dir]).remove(0);
    }
    if let Some(dir) = overlay.report_schemas_dir {
        merged.report_schemas_dir = resolve_dirs(target_root, &[dir]).remove(0);
    }
    let overlay_defaults = overlay.defaults.unwrap_or_default();
    if let Some(id) = clean_id(overlay_defaults.persona_id) {
        merged.defaults_persona_id = Some(id);
    }
    if let Some(id) = clean_id(overlay_defaults.mission_id) {
        merged.defaults_mission_id = Some(id);
    }

    Ok(merged)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

fn sorted_docs(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, CatalogError> {
    fn walk(dir: &Path, suffix: &str, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(&path, suffix, out)?;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
            {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(dir, suffix, &mut out)
        .map_err(|e| CatalogError::invalid(format!("Failed to scan {}: {e}", dir.display())))?;
    out.sort();
    Ok(out)
}

/// Discover all personas across the configured directories and resolve
/// `extends` chains.
pub fn discover_personas(
    config: &CatalogConfig,
) -> Result<BTreeMap<String, PersonaSpec>, CatalogError> {
    let mut raw_by_id: BTreeMap<String, PersonaSpec> = BTreeMap::new();

    for dir in &config.personas_dirs {
        if !dir.is_dir() {
            return Err(CatalogError::invalid(format!(
                "Persona directory not found: {}",
                dir.display()
            )));
        }
        for doc_path in sorted_docs(dir, ".persona.md")? {
            let text = std::fs::read_to_string(&doc_path).map_err(|e| {
                CatalogError::invalid(format!("Failed to read {}: {e}", doc_path.display()))
            })?;
            let (fm, body) = parse_frontmatter(&text, &doc_path)?;

            let spec = PersonaSpec {
                id: require_str(&fm, "id", &doc_path)?,
                name: require_str(&fm, "name", &doc_path)?,
                extends: optional_str(&fm, "extends"),
                body_md: body,
                source_path: doc_path.clone(),
            };

            if let Some(prev) = raw_by_id.get(&spec.id) {
                return Err(CatalogError::coded(
                    "duplicate_persona_id",
                    format!(
                        "Duplicate persona id {:?} in {} and {}.",
                        spec.id,
                        prev.source_path.display(),
                        doc_path.display()
                    ),
                )
                .with_detail("id", &spec.id)
                .with_detail(
                    "paths",
                    vec![
                        prev.source_path.display().to_string(),
                        doc_path.display().to_string(),
                    ],
                ));
            }
            raw_by_id.insert(spec.id.clone(), spec);
        }
    }

    resolve_persona_extends(raw_by_id)
}

/// Discover all missions across the configured directories and resolve
/// `extends` chains, inheritance, and tag merging.
pub fn discover_missions(
    config: &CatalogConfig,
) -> Result<BTreeMap<String, MissionSpec>, CatalogError> {
    let mut raw_by_id: BTreeMap<String, MissionSpec> = BTreeMap::new();

    for dir in &config.missions_dirs {
        if !dir.is_dir() {
            return Err(CatalogError::invalid(format!(
                "Mission directory not found: {}",
                dir.display()
            )));
        }
        for doc_path in sorted_docs(dir, ".mission.md")? {
            let text = std::fs::read_to_string(&doc_path).map_err(|e| {
                CatalogError::invalid(format!("Failed to read {}: {e}", doc_path.display()))
            })?;
            let (fm, body) = parse_frontmatter(&text, &doc_path)?;

            let execution_mode = optional_str(&fm, "execution_mode").unwrap_or_default();
            if !execution_mode.is_empty()
                && !ALLOWED_EXECUTION_MODES.contains(&execution_mode.as_str())
            {
                return Err(CatalogError::invalid(format!(
                    "Unsupported execution_mode {execution_mode:?} in {}. Allowed: {}.",
                    doc_path.display(),
                    ALLOWED_EXECUTION_MODES.join(", ")
                )));
            }

            let spec = MissionSpec {
                id: require_str(&fm, "id", &doc_path)?,
                name: require_str(&fm, "name", &doc_path)?,
                extends: optional_str(&fm, "extends"),
                tags: optional_string_list(&fm, "tags", &doc_path)?,
                execution_mode,
                prompt_template: optional_str(&fm, "prompt_template").unwrap_or_default(),
                report_schema: optional_str(&fm, "report_schema").unwrap_or_default(),
                body_md: body,
                source_path: doc_path.clone(),
                requires_shell: optional_bool(&fm, "requires_shell", &doc_path)?,
                requires_edits: optional_bool(&fm, "requires_edits", &doc_path)?,
            };

            if let Some(prev) = raw_by_id.get(&spec.id) {
                return Err(CatalogError::coded(
                    "duplicate_mission_id",
                    format!(
                        "Duplicate mission id {:?} in {} and {}.",
                        spec.id,
                        prev.source_path.display(),
                        doc_path.display()
                    ),
                )
                .with_detail("id", &spec.id)
                .with_detail(
                    "paths",
                    vec![
                        prev.source_path.display().to_string(),
                        doc_path.display().to_string(),
                    ],
                ));
            }
            raw_by_id.insert(spec.id.clone(), spec);
        }
    }

    resolve_mission_extends(raw_by_id)
}

// ---------------------------------------------------------------------------
// Extends resolution
// ---------------------------------------------------------------------------

fn merge_tags(base: &[String], extra: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for tag in base.iter().chain(extra.iter()) {
        if !out.contains(tag) {
            out.push(tag.clone());
        }
    }
    out
}

/// Resolve persona `extends` chains: base bodies are prepended with
/// blank-line separation, base→derived.
pub fn resolve_persona_extends(
    personas: BTreeMap<String, PersonaSpec>,
) -> Result<BTreeMap<String, PersonaSpec>, CatalogError> {
    fn resolve_one(
        id: &str,
        personas: &BTreeMap<String, PersonaSpec>,
        resolved: &mut BTreeMap<String, PersonaSpec>,
        visiting: &mut Vec<String>,
    ) -> Result<PersonaSpec, CatalogError> {
        if let Some(done) = resolved.get(id) {
            return Ok(done.clone());
        }
        if visiting.iter().any(|v| v == id) {
            return Err(CatalogError::invalid(format!(
                "Persona extends cycle detected at {id:?}."
            )));
        }
        let Some(spec) = personas.get(id) else {
            return Err(CatalogError::invalid(format!(
                "Unknown persona id referenced by extends: {id:?}."
            )));
        };

        visiting.push(id.to_string());
        let mut parts: Vec<String> = Vec::new();
        if let Some(base_id) = &spec.extends {
            parts.push(resolve_one(base_id, personas, resolved, visiting)?.body_md);
        }
        if !spec.body_md.trim().is_empty() {
            parts.push(spec.body_md.trim().to_string());
        }
        visiting.pop();

        let out = PersonaSpec {
            body_md: parts.join("\n\n").trim().to_string(),
            ..spec.clone()
        };
        resolved.insert(id.to_string(), out.clone());
        Ok(out)
    }

    let mut resolved = BTreeMap::new();
    let ids: Vec<String> = personas.keys().cloned().collect();
    for id in ids {
        resolve_one(&id, &personas, &mut resolved, &mut Vec::new())?;
    }
    Ok(resolved)
}

/// Resolve mission `extends` chains: bodies concatenate base→derived, tags
/// union-merge, and `execution_mode` / `prompt_template` / `report_schema` /
/// `requires_*` inherit from the base when absent. A resolved mission must
/// end up with all three bindings present.
pub fn resolve_mission_extends(
    missions: BTreeMap<String, MissionSpec>,
) -> Result<BTreeMap<String, MissionSpec>, CatalogError> {
    fn resolve_one(
        id: &str,
        missions: &BTreeMap<String, MissionSpec>,
        resolved: &mut BTreeMap<String, MissionSpec>,
        visiting: &mut Vec<String>,
    ) -> Result<MissionSpec, CatalogError> {
        if let Some(done) = resolved.get(id) {
            return Ok(done.clone());
        }
        if visiting.iter().any(|v| v == id) {
            return Err(CatalogError::invalid(format!(
                "Mission extends cycle detected at {id:?}."
            )));
        }
        let Some(spec) = missions.get(id) else {
            return Err(CatalogError::invalid(format!(
                "Unknown mission id referenced by extends: {id:?}."
            )));
        };

        visiting.push(id.to_string());
        let base = match &spec.extends {
            Some(base_id) => Some(resolve_one(base_id, missions, resolved, visiting)?),
            None => None,
        };
        visiting.pop();

        let inherit = |own: &str, base_value: Option<&str>| -> String {
            if own.is_empty() {
                base_value.unwrap_or_default().to_string()
            } else {
                own.to_string()
            }
        };

        let execution_mode = inherit(
            &spec.execution_mode,
            base.as_ref().map(|b| b.execution_mode.as_str()),
        );
        let prompt_template = inherit(
            &spec.prompt_template,
            base.as_ref().map(|b| b.prompt_template.as_str()),
        );
        let report_schema = inherit(
            &spec.report_schema,
            base.as_ref().map(|b| b.report_schema.as_str()),
        );

        if execution_mode.is_empty() {
            return Err(CatalogError::invalid(format!(
                "Missing execution_mode in mission {id:?} ({}).",
                spec.source_path.display()
            )));
        }
        if !ALLOWED_EXECUTION_MODES.contains(&execution_mode.as_str()) {
            return Err(CatalogError::invalid(format!(
                "Unsupported execution_mode {execution_mode:?} in resolved mission {id:?}."
            )));
        }
        if prompt_template.is_empty() {
            return Err(CatalogError::invalid(format!(
                "Missing prompt_template in mission {id:?} ({}).",
                spec.source_path.display()
            )));
        }
        if report_schema.is_empty() {
            return Err(CatalogError::invalid(format!(
                "Missing report_schema in mission {id:?} ({}).",
                spec.source_path.display()
            )));
        }

        let mut body_parts: Vec<String> = Vec::new();
        if let Some(base) = &base {
            if !base.body_md.trim().is_empty() {
                body_parts.push(base.body_md.trim().to_string());
            }
        }
        if !spec.body_md.trim().is_empty() {
            body_parts.push(spec.body_md.trim().to_string());
        }

        let out = MissionSpec {
            tags: merge_tags(
                base.as_ref().map(|b| b.tags.as_slice()).unwrap_or(&[]),
                &spec.tags,
            ),
            execution_mode,
            prompt_template,
            report_schema,
            body_md: body_parts.join("\n\n").trim().to_string(),
            requires_shell: spec.requires_shell
                || base.as_ref().is_some_and(|b| b.requires_shell),
            requires_edits: spec.requires_edits
                || base.as_ref().is_some_and(|b| b.requires_edits),
            ..spec.clone()
        };
        resolved.insert(id.to_string(), out.clone());
        Ok(out)
    }

    let mut resolved = BTreeMap::new();
    let ids: Vec<String> = missions.keys().cloned().collect();
    for id in ids {
        resolve_one(&id, &missions, &mut resolved, &mut Vec::new())?;
    }
    Ok(resolved)
}
