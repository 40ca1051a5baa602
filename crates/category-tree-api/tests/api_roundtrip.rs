use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use category_tree_api::{
    AddSatelliteRequest, CategoryTreeApi, RemoveSatelliteRequest, API_CONTRACT_VERSION,
};
use category_tree_core::{
    ContentId, CreateNode, EngineConfig, HierarchyKey, InheritedConfig, MoveNode,
    MutationStatus, PlacementId, RemoveNode, RemoveTarget, SatelliteKind, UpdateConfig,
};
use serde_json::json;

fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("category-tree-api-it-{}.sqlite3", ulid::Ulid::new()))
}

fn cleanup(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let _ = std::fs::remove_file(path);
    }
}

fn key() -> HierarchyKey {
    HierarchyKey::new("acme", "main")
}

fn ids(values: &[&str]) -> Vec<ContentId> {
    values.iter().map(|value| ContentId::from(*value)).collect()
}

fn create(
    api: &CategoryTreeApi,
    parent: PlacementId,
    content_id: &str,
    is_category: bool,
    local_config: serde_json::Value,
) -> Result<PlacementId> {
    let outcome = api.create_node(
        &key(),
        "tester",
        CreateNode {
            parent,
            content_id: content_id.into(),
            is_category,
            local_config: Some(local_config),
            category_config: None,
        },
    )?;
    assert_eq!(outcome.status, MutationStatus::Applied);
    outcome.placement_id.ok_or_else(|| anyhow!("create of {content_id} placed nothing"))
}

/// root -> A{x:1} -> B{y:2} -> E, persisted through the facade.
fn seeded(api: &CategoryTreeApi) -> Result<(PlacementId, PlacementId, PlacementId)> {
    let hierarchy = api.init_hierarchy(&key(), "root".into(), "tester")?;
    let root = hierarchy.root.placement_id;
    let a = create(api, root, "A", true, json!({"x": 1}))?;
    let b = create(api, a, "B", true, json!({"y": 2}))?;
    create(api, b, "E", false, json!({}))?;
    Ok((root, a, b))
}

#[test]
fn contract_version_is_stable() {
    assert_eq!(API_CONTRACT_VERSION, "api.v1");
}

#[test]
fn caches_survive_reopening_the_database() -> Result<()> {
    let db_path = unique_temp_db_path();
    let api = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());
    seeded(&api)?;

    let reopened = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());
    assert_eq!(reopened.get_ancestor_chain(&key(), &"E".into())?, ids(&["A", "B"]));
    assert_eq!(
        reopened.get_inherited_config(&key(), &"E".into())?,
        vec![
            InheritedConfig { source_id: "A".into(), config: json!({"x": 1}) },
            InheritedConfig { source_id: "B".into(), config: json!({"y": 2}) },
        ]
    );
    assert_eq!(reopened.list_hierarchies()?, vec![key()]);
    assert_eq!(reopened.show_hierarchy(&key())?.placement_count(), 4);

    cleanup(&db_path);
    Ok(())
}

#[test]
fn move_to_root_prunes_chain_and_satellite_copies() -> Result<()> {
    let db_path = unique_temp_db_path();
    let api = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());
    let (root, a, b) = seeded(&api)?;

    let added = api.add_satellite(
        "tester",
        AddSatelliteRequest {
            key: key(),
            kind: SatelliteKind::Localization,
            owner_content_id: "A".into(),
            record_key: "title".to_string(),
            payload: json!({"en": "Apparel"}),
        },
    )?;
    assert_eq!(added.satellites.created, 3);
    assert_eq!(added.affected, ids(&["B", "E"]));
    let listing = api.list_satellites(&key(), SatelliteKind::Localization, &"E".into())?;
    assert_eq!(listing.inherited.len(), 1);
    assert_eq!(listing.inherited[0].source_ancestor_id, Some("A".into()));

    let moved = api.move_node(&key(), "tester", MoveNode { placement_id: b, new_parent: root })?;
    assert_eq!(moved.affected, ids(&["B", "E"]));
    assert_eq!(moved.satellites.deleted, 2);
    assert_eq!(api.get_ancestor_chain(&key(), &"E".into())?, ids(&["B"]));
    let listing = api.list_satellites(&key(), SatelliteKind::Localization, &"E".into())?;
    assert!(listing.inherited.is_empty());

    api.move_node(&key(), "tester", MoveNode { placement_id: b, new_parent: a })?;
    assert!(api.verify(&key())?.is_consistent());

    cleanup(&db_path);
    Ok(())
}

#[test]
fn update_config_and_remove_keep_store_consistent() -> Result<()> {
    let db_path = unique_temp_db_path();
    let api = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());
    seeded(&api)?;

    let updated = api.update_config(
        &key(),
        "tester",
        UpdateConfig {
            content_id: "A".into(),
            local_config: json!({"x": 5}),
            category_config: None,
        },
    )?;
    assert_eq!(updated.status, MutationStatus::Applied);
    let snapshot = api.get_inherited_config(&key(), &"E".into())?;
    assert_eq!(snapshot[0].config, json!({"x": 5}));

    let removed = api.remove_node(
        &key(),
        "tester",
        RemoveNode { target: RemoveTarget::Content("B".into()), purge: false },
    )?;
    assert_eq!(removed.status, MutationStatus::Applied);
    assert!(api.get_content(&key(), &"E".into())?.removed);
    assert!(api.get_ancestor_chain(&key(), &"E".into()).is_err());
    assert!(api.verify(&key())?.is_consistent());

    let refreshed = api.refresh(&key(), "tester", &ids(&["A"]))?;
    assert!(refreshed.is_success());

    cleanup(&db_path);
    Ok(())
}

#[test]
fn unknown_satellite_removal_is_a_no_op() -> Result<()> {
    let db_path = unique_temp_db_path();
    let api = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());
    seeded(&api)?;

    let outcome = api.remove_satellite(
        "tester",
        &RemoveSatelliteRequest {
            key: key(),
            kind: SatelliteKind::FunctionLink,
            owner_content_id: "A".into(),
            record_key: "missing".to_string(),
        },
    )?;
    assert_eq!(outcome.status, MutationStatus::NoOp);
    assert!(outcome.reason.is_some());

    cleanup(&db_path);
    Ok(())
}

#[test]
fn second_init_and_blank_operator_are_rejected() -> Result<()> {
    let db_path = unique_temp_db_path();
    let api = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());
    api.init_hierarchy(&key(), "root".into(), "tester")?;

    assert!(api.init_hierarchy(&key(), "root".into(), "tester").is_err());
    let other = HierarchyKey::new("acme", "draft");
    assert!(api.init_hierarchy(&other, "root".into(), "  ").is_err());
    assert!(api.show_hierarchy(&other).is_err());

    cleanup(&db_path);
    Ok(())
}
