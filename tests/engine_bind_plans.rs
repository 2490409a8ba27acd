mod common;

use common::{all_columns, import, match_all, open_store, quad};
use quadstore::{default_graph_rid, BindFlags, BindQuery, Quad, Rid, SameMask, DEFAULT_GRAPH_URI};
use test_log::test;

fn seeded() -> quadstore::Result<(tempfile::TempDir, quadstore::Engine)> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    import(
        &mut engine,
        &[
            quad("urn:g1", "u:alice", "u:knows", "u:bob"),
            quad("urn:g1", "u:alice", "u:likes", "u:carol"),
            quad("urn:g1", "u:bob", "u:knows", "u:carol"),
            quad("urn:g2", "u:carol", "u:knows", "u:alice"),
            quad("urn:g2", "u:carol", "u:likes", "u:carol"),
        ],
        &[],
    )?;

    Ok((dir, engine))
}

#[test]
fn distinct_models_uses_the_model_hash() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let query = BindQuery {
        flags: BindFlags::MODEL | BindFlags::DISTINCT | BindFlags::BY_SUBJECT,
        ..match_all()
    };

    let result = engine.bind(&query)?;
    let mut models = result.columns()[0].clone();
    models.sort_unstable();

    let mut expected = vec![Rid::uri("urn:g1"), Rid::uri("urn:g2")];
    expected.sort_unstable();
    assert_eq!(expected, models);

    Ok(())
}

#[test]
fn distinct_predicates_uses_the_predicate_list() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let query = BindQuery {
        flags: BindFlags::PREDICATE | BindFlags::DISTINCT | BindFlags::BY_SUBJECT,
        ..match_all()
    };

    let result = engine.bind(&query)?;
    let mut preds = result.columns()[0].clone();
    preds.sort_unstable();

    let mut expected = vec![Rid::uri("u:knows"), Rid::uri("u:likes")];
    expected.sort_unstable();
    assert_eq!(expected, preds);

    Ok(())
}

#[test]
fn distinct_objects_of_a_predicate() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let query = BindQuery {
        flags: BindFlags::OBJECT | BindFlags::DISTINCT | BindFlags::BY_SUBJECT,
        ..match_all()
    }
    .with_predicates(vec![Rid::uri("u:knows")]);

    let result = engine.bind(&query)?;
    let mut objects = result.columns()[0].clone();
    objects.sort_unstable();

    let mut expected = vec![Rid::uri("u:bob"), Rid::uri("u:carol"), Rid::uri("u:alice")];
    expected.sort_unstable();
    assert_eq!(expected, objects);

    Ok(())
}

#[test]
fn graph_scoped_walk() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let result = engine.bind(&match_all().with_models(vec![Rid::uri("urn:g2")]))?;
    assert_eq!(2, result.len());
    for row in common::rows(&result) {
        assert_eq!(Rid::uri("urn:g2"), row[0]);
    }

    // unknown graph matches nothing
    let result = engine.bind(&match_all().with_models(vec![Rid::uri("urn:gX")]))?;
    assert_eq!(0, result.len());

    Ok(())
}

#[test]
fn subject_predicate_lookup() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let result = engine.bind(
        &match_all()
            .with_subjects(vec![Rid::uri("u:alice")])
            .with_predicates(vec![Rid::uri("u:knows")]),
    )?;

    assert_eq!(1, result.len());
    assert_eq!(Rid::uri("u:bob"), common::rows(&result)[0][3]);

    Ok(())
}

#[test]
fn object_direction_lookup() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    // who likes carol: alice (g1) and carol herself (g2)
    let mut query = match_all()
        .with_predicates(vec![Rid::uri("u:likes")])
        .with_objects(vec![Rid::uri("u:carol")]);
    query.flags = all_columns() | BindFlags::BY_OBJECT;

    let result = engine.bind(&query)?;
    assert_eq!(2, result.len());

    let subjects: Vec<Rid> = common::rows(&result).iter().map(|r| r[1]).collect();
    assert!(subjects.contains(&Rid::uri("u:alice")));
    assert!(subjects.contains(&Rid::uri("u:carol")));

    // and who knows carol: just bob
    let mut query = match_all()
        .with_predicates(vec![Rid::uri("u:knows")])
        .with_objects(vec![Rid::uri("u:carol")]);
    query.flags = all_columns() | BindFlags::BY_OBJECT;
    assert_eq!(1, engine.bind(&query)?.len());

    Ok(())
}

#[test]
fn subject_only_scans_every_tree() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let result = engine.bind(&match_all().with_subjects(vec![Rid::uri("u:alice")]))?;
    assert_eq!(2, result.len());

    Ok(())
}

#[test]
fn conjunctive_zip_of_subjects_and_predicates() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    // zipped positionally: (alice, knows) and (bob, likes); a cross
    // product would also yield (alice, likes) and (bob, knows)
    let result = engine.bind(
        &match_all()
            .with_subjects(vec![Rid::uri("u:alice"), Rid::uri("u:bob")])
            .with_predicates(vec![Rid::uri("u:knows"), Rid::uri("u:likes")]),
    )?;

    let rows = common::rows(&result);
    assert_eq!(1, rows.len());
    assert_eq!(
        [
            Rid::uri("urn:g1"),
            Rid::uri("u:alice"),
            Rid::uri("u:knows"),
            Rid::uri("u:bob"),
        ],
        rows[0],
    );

    Ok(())
}

#[test]
fn same_variable_mask_filters_rows() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    // s == o holds only for (carol likes carol)
    let mut query = match_all();
    query.flags = query.flags.with_same(SameMask::Xaxa);

    let result = engine.bind(&query)?;
    assert_eq!(1, result.len());
    let row = common::rows(&result)[0];
    assert_eq!(row[1], row[3]);
    assert_eq!(Rid::uri("u:carol"), row[1]);

    Ok(())
}

#[test]
fn default_graph_filter_drops_default_rows() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    import(
        &mut engine,
        &[
            quad(DEFAULT_GRAPH_URI, "u:s1", "u:p", "u:o1"),
            quad("urn:g1", "u:s2", "u:p", "u:o2"),
        ],
        &[],
    )?;

    assert_eq!(2, engine.bind(&match_all())?.len());

    let mut query = match_all();
    query.flags = query.flags | BindFlags::EXCLUDE_DEFAULT_GRAPH;
    let result = engine.bind(&query)?;

    assert_eq!(1, result.len());
    assert_ne!(default_graph_rid(), common::rows(&result)[0][0]);

    Ok(())
}

#[test]
fn reverse_bind_intersects_subjects() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    // alice and bob both know carol; only alice also likes dana
    import(
        &mut engine,
        &[
            quad("urn:g", "u:alice", "u:knows", "u:carol"),
            quad("urn:g", "u:bob", "u:knows", "u:carol"),
            quad("urn:g", "u:alice", "u:likes", "u:dana"),
        ],
        &[],
    )?;

    let mut query = match_all()
        .with_predicates(vec![Rid::uri("u:knows"), Rid::uri("u:likes")])
        .with_objects(vec![Rid::uri("u:carol"), Rid::uri("u:dana")]);
    query.flags = BindFlags::SUBJECT | BindFlags::BY_SUBJECT;

    let result = engine.reverse_bind(&query)?;
    assert_eq!(vec![Rid::uri("u:alice")], result.columns()[0]);

    Ok(())
}

#[test]
fn reverse_bind_by_object_is_rejected() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    let mut query = match_all();
    query.flags = BindFlags::SUBJECT | BindFlags::BY_OBJECT;

    assert!(matches!(
        engine.reverse_bind(&query),
        Err(quadstore::Error::Unsupported("reverse bind by object"))
    ));

    Ok(())
}

#[test]
fn bind_by_object_without_object_constraint_is_empty() -> quadstore::Result<()> {
    // a documented quirk: the object-direction fallback iterates the O
    // constraint vector, so an empty one yields nothing
    let (_dir, mut engine) = seeded()?;

    let mut query = match_all();
    query.flags = all_columns() | BindFlags::BY_OBJECT;
    query.subjects = vec![Rid::uri("u:alice")];

    let result = engine.bind(&query)?;
    assert_eq!(0, result.len());

    Ok(())
}

#[test]
fn everything_scan_returns_the_full_store() -> quadstore::Result<()> {
    let (_dir, mut engine) = seeded()?;

    let result = engine.bind(&match_all())?;
    assert_eq!(5, result.len());

    // round trip: the rows are exactly what was inserted
    let rows = common::rows(&result);
    assert!(rows.contains(&[
        Rid::uri("urn:g1"),
        Rid::uri("u:alice"),
        Rid::uri("u:knows"),
        Rid::uri("u:bob"),
    ]));
    assert!(rows.contains(&[
        Rid::uri("urn:g2"),
        Rid::uri("u:carol"),
        Rid::uri("u:likes"),
        Rid::uri("u:carol"),
    ]));

    Ok(())
}

#[test]
fn quads_route_through_quad_struct() {
    let q = Quad::new(Rid(1), Rid(2), Rid(3), Rid(4));
    let arr: [Rid; 4] = q.into();
    assert_eq!(q, Quad::from(arr));
}
