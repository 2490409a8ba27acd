mod common;

use common::{import, match_all, open_store, quad};
use quadstore::{Quad, Rid, RID_NULL};
use test_log::test;

#[test]
fn delete_graph_removes_all_its_quads() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let g1 = Rid::uri("urn:g1");
    import(
        &mut engine,
        &[
            quad("urn:g1", "u:s1", "u:p1", "u:o1"),
            quad("urn:g2", "u:s2", "u:p1", "u:o2"),
        ],
        &[],
    )?;

    engine.delete_models(&[g1])?;

    // the other graph survives
    let result = engine.bind(&match_all())?;
    assert_eq!(1, result.len());

    let result = engine.bind(&match_all().with_models(vec![g1]))?;
    assert_eq!(0, result.len());

    assert_eq!(0, engine.model_usage(g1)?);

    // double delete is a no-op
    engine.delete_models(&[g1])?;
    assert_eq!(1, engine.bind(&match_all())?.len());

    Ok(())
}

#[test]
fn delete_small_graph_takes_search_path() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    // a big graph to make the victim's share tiny plus a 3-triple victim
    let mut quads: Vec<Quad> = (0..500)
        .map(|i| quad("urn:big", &format!("u:s{i}"), "u:p", &format!("u:o{i}")))
        .collect();
    quads.push(quad("urn:small", "u:a", "u:p", "u:x"));
    quads.push(quad("urn:small", "u:b", "u:p2", "u:y"));
    quads.push(quad("urn:small", "u:c", "u:p", "u:z"));

    import(&mut engine, &quads, &[])?;

    let small = Rid::uri("urn:small");
    engine.delete_models(&[small])?;

    assert_eq!(0, engine.model_usage(small)?);
    assert_eq!(500, engine.bind(&match_all())?.len());

    // no rows or blocks were leaked along the way
    let report = engine.check_consistency()?;
    assert_eq!(0, report.ptable_leaks);
    assert_eq!(0, report.tbchain_leaks);

    Ok(())
}

#[test]
fn wipe_all_with_null_sentinel() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    import(
        &mut engine,
        &[
            quad("urn:g1", "u:s1", "u:p1", "u:o1"),
            quad("urn:g2", "u:s2", "u:p2", "u:o2"),
        ],
        &["u:s1", "u:p1"],
    )?;

    engine.delete_models(&[RID_NULL])?;

    assert_eq!(0, engine.bind(&match_all())?.len());
    assert_eq!(0, engine.size()?.quads_s);
    assert_eq!(0, engine.size()?.resources);

    // the wiped segment accepts new data
    import(&mut engine, &[quad("urn:g1", "u:s9", "u:p9", "u:o9")], &[])?;
    assert_eq!(1, engine.bind(&match_all())?.len());

    Ok(())
}

#[test]
fn delete_quads_is_exact() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let keep = quad("urn:g", "u:s1", "u:p", "u:o1");
    let gone = quad("urn:g", "u:s2", "u:p", "u:o2");
    import(&mut engine, &[keep, gone], &[])?;

    engine.delete_quads(&[gone])?;

    // graph-scoped read re-verifies against the trees and only sees the
    // surviving quad
    let result = engine.bind(&match_all().with_models(vec![Rid::uri("urn:g")]))?;
    assert_eq!(1, result.len());
    assert_eq!(
        vec![[keep.graph, keep.subject, keep.predicate, keep.object]],
        common::rows(&result),
    );

    // tree-path reads agree
    let result = engine.bind(&match_all().with_predicates(vec![Rid::uri("u:p")]))?;
    assert_eq!(1, result.len());

    Ok(())
}

#[test]
fn delete_quads_then_reinsert() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let q = quad("urn:g", "u:s", "u:p", "u:o");
    import(&mut engine, &[q], &[])?;

    engine.delete_quads(&[q])?;

    // the graph-scoped read weeds the stale triple out of the chain
    assert_eq!(
        0,
        engine
            .bind(&match_all().with_models(vec![q.graph]))
            .map(|r| r.len())?
    );

    import(&mut engine, &[q], &[])?;
    let result = engine.bind(&match_all().with_models(vec![q.graph]))?;
    assert_eq!(1, result.len());

    Ok(())
}
