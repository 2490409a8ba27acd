mod common;

use common::{all_columns, import, match_all, open_store, quad, rows};
use quadstore::{BindFlags, BindQuery, Quad, Resource, Rid};
use test_log::test;

#[test]
fn insert_then_query_by_predicate() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let q = quad("urn:g1", "http://example/s1", "http://example/p1", "http://example/o1");
    import(
        &mut engine,
        &[q],
        &["urn:g1", "http://example/s1", "http://example/p1", "http://example/o1"],
    )?;

    let result = engine.bind(
        &match_all().with_predicates(vec![Rid::uri("http://example/p1")]),
    )?;

    assert_eq!(1, result.len());
    assert_eq!(
        vec![[q.graph, q.subject, q.predicate, q.object]],
        rows(&result),
    );

    // a predicate nobody used matches nothing
    let result = engine.bind(
        &match_all().with_predicates(vec![Rid::uri("http://example/unused")]),
    )?;
    assert_eq!(0, result.len());

    Ok(())
}

#[test]
fn duplicate_inserts_commit_once() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let q = quad("urn:g", "u:s", "u:p", "u:o");

    engine.start_import()?;
    engine.quad_import(&[q, q, q])?;
    engine.stop_import()?;

    let result = engine.bind(&match_all())?;
    assert_eq!(1, result.len());

    // the same quad in a later run is also deduplicated
    engine.start_import()?;
    engine.quad_import(&[q])?;
    engine.stop_import()?;

    assert_eq!(1, engine.bind(&match_all())?.len());

    Ok(())
}

#[test]
fn bind_with_limit_zero_is_empty_but_matches() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    import(&mut engine, &[quad("urn:g", "u:s", "u:p", "u:o")], &[])?;

    let result = engine.bind(&match_all().with_limit(0))?;
    assert!(result.is_match());
    assert_eq!(0, result.len());

    Ok(())
}

#[test]
fn bind_limit_caps_rows() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let quads: Vec<Quad> = (0..100)
        .map(|i| quad("urn:g", &format!("u:s{i}"), "u:p", "u:o"))
        .collect();
    import(&mut engine, &quads, &[])?;

    assert_eq!(7, engine.bind(&match_all().with_limit(7))?.len());
    assert_eq!(100, engine.bind(&match_all())?.len());

    Ok(())
}

#[test]
fn zero_column_bind_distinguishes_match_from_no_match() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let existence = BindQuery {
        flags: BindFlags::BY_SUBJECT,
        ..match_all()
    };

    // empty store: no quads at all
    assert!(!engine.bind(&existence)?.is_match());

    import(&mut engine, &[quad("urn:g", "u:s", "u:p", "u:o")], &[])?;

    let result = engine.bind(&existence)?;
    assert!(result.is_match());
    assert!(result.columns().is_empty());

    Ok(())
}

#[test]
fn resolve_roundtrip() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let uri = Resource::uri("http://example/s1");
    let lit = Resource::literal("a plain literal that is long enough to spill", Rid::uri("u:none"));

    engine.start_import()?;
    engine.res_import(&[uri.clone(), lit.clone()])?;
    engine.res_import_commit()?;
    engine.stop_import()?;

    let got = engine.resolve(&[lit.rid, uri.rid])?;
    assert_eq!(lit, got[0]);
    assert_eq!(uri, got[1]);

    // blank nodes resolve without touching the store
    let bnode = Rid::bnode(77);
    let got = engine.resolve(&[bnode])?;
    assert_eq!(format!("_:b{:x}", bnode.0), got[0].lex);

    Ok(())
}

#[test]
fn quads_invisible_until_stop_import() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    engine.start_import()?;
    engine.quad_import(&[quad("urn:g", "u:s", "u:p", "u:o")])?;

    // staged but not committed: bind sees nothing
    assert_eq!(0, engine.bind(&match_all())?.len());

    engine.stop_import()?;
    assert_eq!(1, engine.bind(&match_all())?.len());

    Ok(())
}

#[test]
fn subject_split_keeps_both_rows_addressable() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    // subjects differing in a single bit share a long tree prefix
    let g = Rid::uri("urn:g");
    let p = Rid::uri("u:p");
    let o = Rid::uri("u:o");
    let s1 = Rid(0x0000_0000_0000_0001);
    let s2 = Rid(0x4000_0000_0000_0001);

    engine.start_import()?;
    engine.quad_import(&[Quad::new(g, s1, p, o), Quad::new(g, s2, p, o)])?;
    engine.stop_import()?;

    let result = engine.bind(
        &match_all()
            .with_subjects(vec![s1])
            .with_predicates(vec![p]),
    )?;
    assert_eq!(1, result.len());
    assert_eq!(vec![[g, s1, p, o]], rows(&result));

    assert_eq!(2, engine.bind(&match_all())?.len());

    Ok(())
}

#[test]
fn start_import_enforces_the_disk_limit() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = quadstore::Config::new(dir.path()).disk_limit_gb(f64::MAX);
    quadstore::create_store(&config, common::KB, &quadstore::StoreOptions::new(1))?;

    let mut engine = quadstore::Engine::open(&config, common::KB, 0)?;
    assert!(matches!(
        engine.start_import(),
        Err(quadstore::Error::Capacity)
    ));

    Ok(())
}

#[test]
fn transactions_are_rejected() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    assert!(matches!(
        engine.transaction(1),
        Err(quadstore::Error::Unsupported("transactions"))
    ));

    Ok(())
}

#[test]
fn bind_requires_exactly_one_direction() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let mut no_direction = match_all();
    no_direction.flags = all_columns();
    assert!(engine.bind(&no_direction).is_err());

    let mut both = match_all();
    both.flags = all_columns() | BindFlags::BY_SUBJECT | BindFlags::BY_OBJECT;
    assert!(engine.bind(&both).is_err());

    Ok(())
}
