// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn store_in(dir: &tempfile::TempDir) -> FileKbStore {
    FileKbStore::open(
        dir.path().join("agent"),
        dir.path().join("project"),
        dir.path().join("user"),
    )
}

fn seed_doc(dir: &tempfile::TempDir, name: &str, content: &str) -> anyhow::Result<String> {
    let path = dir.path().join(name);
    std::fs::write(&path, content)?;
    Ok(path.to_string_lossy().into_owned())
}

#[test]
fn ingest_then_search_finds_document() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    let doc = seed_doc(&dir, "deploy.md", "release pipeline runs nightly against staging")?;

    let ids = store.ingest(&[doc], Scope::Agent, None).map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(ids.len(), 1);

    let hits = store.search("staging pipeline", Scope::Agent, 5).map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, ids[0]);
    assert!(hits[0].score > 0.9);
    Ok(())
}

#[test]
fn scopes_are_isolated() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    let doc = seed_doc(&dir, "note.md", "observability dashboards live in grafana")?;
    store.ingest(&[doc], Scope::Project, None).map_err(|e| anyhow::anyhow!("{e}"))?;

    assert!(store.search("grafana", Scope::Agent, 5).map_err(|e| anyhow::anyhow!("{e}"))?.is_empty());
    assert_eq!(
        store.search("grafana", Scope::Project, 5).map_err(|e| anyhow::anyhow!("{e}"))?.len(),
        1
    );
    Ok(())
}

#[test]
fn items_survive_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    let doc = seed_doc(&dir, "a.md", "first document body text")?;
    let ids = store.ingest(&[doc], Scope::User, None).map_err(|e| anyhow::anyhow!("{e}"))?;
    drop(store);

    let store = store_in(&dir);
    let items = store.get_items(Scope::User, 10, 0).map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, ids[0]);
    Ok(())
}

#[test]
fn get_items_pages() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    for n in 0..5 {
        let doc = seed_doc(&dir, &format!("d{n}.md"), &format!("document number {n} body"))?;
        store.ingest(&[doc], Scope::Agent, None).map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    let page = store.get_items(Scope::Agent, 2, 2).map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(page.len(), 2);
    assert!(page[0].content.contains("number 2"));
    assert!(page[1].content.contains("number 3"));
    Ok(())
}

#[test]
fn get_by_ids_filters() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    let a = seed_doc(&dir, "a.md", "alpha body content here")?;
    let b = seed_doc(&dir, "b.md", "beta body content here")?;
    let ids = store.ingest(&[a, b], Scope::Agent, None).map_err(|e| anyhow::anyhow!("{e}"))?;

    let got = store
        .get_by_ids(Scope::Agent, &[ids[1].clone()])
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, ids[1]);
    Ok(())
}

#[test]
fn insert_supports_copy_between_scopes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    let doc = seed_doc(&dir, "a.md", "shared runbook for incident response")?;
    let ids = store.ingest(&[doc], Scope::Agent, None).map_err(|e| anyhow::anyhow!("{e}"))?;

    let source = store
        .get_by_ids(Scope::Agent, &ids)
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .remove(0);
    store.insert(Scope::Project, source).map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(
        store.search("runbook", Scope::Project, 5).map_err(|e| anyhow::anyhow!("{e}"))?.len(),
        1
    );
    Ok(())
}

#[test]
fn missing_file_fails_ingest() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(&dir);
    let err = match store.ingest(&["/no/such/file.md".to_owned()], Scope::Agent, None) {
        Err(e) => e,
        Ok(ids) => anyhow::bail!("ingested phantom file: {ids:?}"),
    };
    assert_eq!(err.code, "kb.ingest_failed");
    Ok(())
}
