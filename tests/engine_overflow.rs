mod common;

use common::{match_all, open_store, quad};
use quadstore::{Quad, Rid};
use test_log::test;

// enough quads to overflow the 10,240-quad staging buffer twice and force
// the import session through the on-disk pending lists
const COUNT: usize = 21_000;

#[test]
fn oversized_import_goes_through_pending_lists() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    engine.start_import()?;

    let mut staged = Vec::with_capacity(1000);
    for i in 0..COUNT {
        staged.push(quad(
            "urn:g",
            &format!("u:s{}", i % 4096),
            &format!("u:p{}", i % 37),
            &format!("u:o{i}"),
        ));
        if staged.len() == 1000 {
            engine.quad_import(&staged)?;
            staged.clear();
        }
    }
    engine.quad_import(&staged)?;
    engine.stop_import()?;

    let size = engine.size()?;
    assert_eq!(COUNT as u64, size.quads_s);
    assert_eq!(COUNT as u64, size.quads_o);

    // spot checks through both directions
    let result = engine.bind(&match_all().with_subjects(vec![Rid::uri("u:s17")]))?;
    assert_eq!(
        (COUNT / 4096) + usize::from(17 < COUNT % 4096),
        result.len(),
    );

    let result = engine.bind(&match_all().with_predicates(vec![Rid::uri("u:p5")]))?;
    assert!(!result.is_empty());

    // the pending lists were cleaned off the disk
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(common::KB).join("0000"))?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("pl-"))
        .collect();
    assert!(leftovers.is_empty());

    let report = engine.check_consistency()?;
    assert_eq!(0, report.ptable_leaks);
    assert_eq!(COUNT as u64, report.rows);

    Ok(())
}

#[test]
fn oversized_import_deduplicates() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_config, mut engine) = open_store(dir.path())?;

    // the same 64 quads over and over, spilling to the pending lists
    let base: Vec<Quad> = (0..64)
        .map(|i| quad("urn:g", &format!("u:s{i}"), "u:p", "u:o"))
        .collect();

    engine.start_import()?;
    for _ in 0..200 {
        engine.quad_import(&base)?;
    }
    engine.stop_import()?;

    assert_eq!(64, engine.size()?.quads_s);
    assert_eq!(64, engine.bind(&match_all().with_limit(1000))?.len());

    Ok(())
}
