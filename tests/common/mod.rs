use quadstore::{
    BindFlags, BindQuery, BindResult, Config, Engine, Quad, Resource, Rid, StoreOptions,
};
use std::path::Path;

pub const KB: &str = "testkb";

/// Creates a single-segment store under `dir` and opens its engine.
///
/// The free-disk threshold is lifted so the suite runs on cramped CI
/// machines; the threshold itself is covered by a dedicated test.
#[allow(dead_code)]
pub fn open_store(dir: &Path) -> quadstore::Result<(Config, Engine)> {
    let config = Config::new(dir).disk_limit_gb(0.0);
    quadstore::create_store(&config, KB, &StoreOptions::new(1))?;
    let engine = Engine::open(&config, KB, 0)?;

    Ok((config, engine))
}

/// Same, but with per-graph triple files enabled.
#[allow(dead_code)]
pub fn open_model_files_store(dir: &Path) -> quadstore::Result<(Config, Engine)> {
    let config = Config::new(dir).disk_limit_gb(0.0);
    quadstore::create_store(&config, KB, &StoreOptions::new(1).model_files(true))?;
    let engine = Engine::open(&config, KB, 0)?;

    Ok((config, engine))
}

/// A quad of URI terms.
#[allow(dead_code)]
pub fn quad(g: &str, s: &str, p: &str, o: &str) -> Quad {
    Quad::new(Rid::uri(g), Rid::uri(s), Rid::uri(p), Rid::uri(o))
}

/// Registers the resources of `quads` and imports the quads in one run.
#[allow(dead_code)]
pub fn import(engine: &mut Engine, quads: &[Quad], lex: &[&str]) -> quadstore::Result<()> {
    engine.start_import()?;
    engine.res_import(&lex.iter().map(|l| Resource::uri(*l)).collect::<Vec<_>>())?;
    engine.quad_import(quads)?;
    engine.stop_import()?;

    Ok(())
}

#[allow(dead_code)]
pub fn all_columns() -> BindFlags {
    BindFlags::MODEL | BindFlags::SUBJECT | BindFlags::PREDICATE | BindFlags::OBJECT
}

/// A `(M S P O)` wildcard query returning all columns.
#[allow(dead_code)]
pub fn match_all() -> BindQuery {
    BindQuery::everything()
}

/// Rows of a four-column result as `[g, s, p, o]` tuples.
#[allow(dead_code)]
pub fn rows(result: &BindResult) -> Vec<[Rid; 4]> {
    let cols = result.columns();
    assert_eq!(4, cols.len(), "expected a four-column result");

    let mut out: Vec<[Rid; 4]> = (0..cols[0].len())
        .map(|i| [cols[0][i], cols[1][i], cols[2][i], cols[3][i]])
        .collect();
    out.sort_unstable();

    out
}
