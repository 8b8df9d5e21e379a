// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end catalog tests over on-disk fixtures.

use ft_catalog::{
    CatalogConfig, discover_missions, discover_personas, load_catalog_config,
};
use std::path::Path;

fn write(path: &Path, text: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

fn base_repo(root: &Path) {
    write(
        &root.join("configs/catalog.yaml"),
        "version: 1\npersonas_dirs: [catalog/personas]\nmissions_dirs: [catalog/missions]\nprompt_templates_dir: catalog/templates\nreport_schemas_dir: catalog/schemas\ndefaults:\n  persona_id: base_dev\n  mission_id: explore\n",
    );
    std::fs::create_dir_all(root.join("catalog/personas")).unwrap();
    std::fs::create_dir_all(root.join("catalog/missions")).unwrap();
    std::fs::create_dir_all(root.join("catalog/templates")).unwrap();
    std::fs::create_dir_all(root.join("catalog/schemas")).unwrap();
}

fn config_for(root: &Path) -> CatalogConfig {
    load_catalog_config(root, None).unwrap()
}

#[test]
fn config_loads_and_resolves_relative_dirs() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    let config = config_for(dir.path());
    assert_eq!(config.version, 1);
    assert_eq!(config.personas_dirs, vec![dir.path().join("catalog/personas")]);
    assert_eq!(config.defaults_persona_id.as_deref(), Some("base_dev"));
}

#[test]
fn target_overlay_appends_dirs_and_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    let target = dir.path().join("target");
    write(
        &target.join(".usertest/catalog.yaml"),
        "personas_dirs: [docs/personas]\ndefaults:\n  mission_id: audit\n",
    );

    let config = load_catalog_config(dir.path(), Some(&target)).unwrap();
    assert_eq!(config.personas_dirs.len(), 2);
    assert_eq!(config.personas_dirs[1], target.join("docs/personas"));
    assert_eq!(config.defaults_mission_id.as_deref(), Some("audit"));
    assert_eq!(config.defaults_persona_id.as_deref(), Some("base_dev"));
}

#[test]
fn overlay_version_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    let target = dir.path().join("target");
    write(&target.join(".usertest/catalog.yaml"), "version: 2\n");

    let err = load_catalog_config(dir.path(), Some(&target)).unwrap_err();
    assert!(err.to_string().contains("version mismatch"));
}

#[test]
fn persona_extends_chain_concatenates_base_first() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/personas/base.persona.md"),
        "---\nid: base_dev\nname: Base Dev\n---\nReads docs first.\n",
    );
    write(
        &dir.path().join("catalog/personas/impatient.persona.md"),
        "---\nid: impatient_dev\nname: Impatient Dev\nextends: base_dev\n---\nSkims, then runs commands.\n",
    );

    let personas = discover_personas(&config_for(dir.path())).unwrap();
    let resolved = &personas["impatient_dev"];
    assert_eq!(
        resolved.body_md,
        "Reads docs first.\n\nSkims, then runs commands."
    );
}

#[test]
fn persona_cycle_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/personas/a.persona.md"),
        "---\nid: a\nname: A\nextends: b\n---\nA body.\n",
    );
    write(
        &dir.path().join("catalog/personas/b.persona.md"),
        "---\nid: b\nname: B\nextends: a\n---\nB body.\n",
    );

    let err = discover_personas(&config_for(dir.path())).unwrap_err();
    assert!(err.to_string().contains("extends cycle detected"));
}

#[test]
fn duplicate_persona_id_reports_both_paths() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/personas/one.persona.md"),
        "---\nid: dup\nname: One\n---\nFirst.\n",
    );
    write(
        &dir.path().join("catalog/personas/two.persona.md"),
        "---\nid: dup\nname: Two\n---\nSecond.\n",
    );

    let err = discover_personas(&config_for(dir.path())).unwrap_err();
    assert_eq!(err.code.as_deref(), Some("duplicate_persona_id"));
    let paths = err.details["paths"].as_array().unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths[0].as_str().unwrap().contains("one.persona.md"));
    assert!(paths[1].as_str().unwrap().contains("two.persona.md"));
}

#[test]
fn mission_inherits_bindings_and_merges_tags() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/missions/explore.mission.md"),
        "---\nid: explore\nname: Explore\nexecution_mode: single_pass_inline_report\nprompt_template: default.md\nreport_schema: report.schema.json\ntags: [usability, onboarding]\nrequires_shell: true\n---\nExplore the repo.\n",
    );
    write(
        &dir.path().join("catalog/missions/audit.mission.md"),
        "---\nid: audit\nname: Audit\nextends: explore\ntags: [onboarding, depth]\n---\nThen audit the docs.\n",
    );

    let missions = discover_missions(&config_for(dir.path())).unwrap();
    let audit = &missions["audit"];
    assert_eq!(audit.execution_mode, "single_pass_inline_report");
    assert_eq!(audit.prompt_template, "default.md");
    assert_eq!(audit.report_schema, "report.schema.json");
    assert!(audit.requires_shell);
    assert_eq!(audit.tags, vec!["usability", "onboarding", "depth"]);
    assert_eq!(
        audit.body_md,
        "Explore the repo.\n\nThen audit the docs."
    );
}

#[test]
fn mission_without_execution_mode_anywhere_fails() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/missions/bare.mission.md"),
        "---\nid: bare\nname: Bare\nprompt_template: t.md\nreport_schema: s.json\n---\nBody.\n",
    );

    let err = discover_missions(&config_for(dir.path())).unwrap_err();
    assert!(err.to_string().contains("Missing execution_mode"));
}

#[test]
fn unknown_execution_mode_is_rejected_at_parse() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/missions/odd.mission.md"),
        "---\nid: odd\nname: Odd\nexecution_mode: multi_turn\nprompt_template: t.md\nreport_schema: s.json\n---\nBody.\n",
    );

    let err = discover_missions(&config_for(dir.path())).unwrap_err();
    assert!(err.to_string().contains("Unsupported execution_mode"));
}

#[test]
fn unknown_extends_target_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    base_repo(dir.path());
    write(
        &dir.path().join("catalog/personas/solo.persona.md"),
        "---\nid: solo\nname: Solo\nextends: missing_base\n---\nBody.\n",
    );

    let err = discover_personas(&config_for(dir.path())).unwrap_err();
    assert!(err.to_string().contains("Unknown persona id"));
}
