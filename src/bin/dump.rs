// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dumps a KB's quads as TriX.

use clap::Parser;
use quadstore::{metadata, BindQuery, Config, Engine, Metadata, Resource, Rid, RidKind};
use std::io::{BufWriter, Write};

#[derive(Parser)]
#[command(name = "qs-dump", about = "Dump a KB as TriX")]
struct Args {
    /// Name of the KB
    kbname: String,

    /// Output file ("-" for stdout)
    output: String,
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn write_term(out: &mut impl Write, res: &Resource) -> std::io::Result<()> {
    match res.rid.kind() {
        RidKind::Uri => writeln!(out, "    <uri>{}</uri>", xml_escape(&res.lex)),
        RidKind::BlankNode => writeln!(out, "    <id>{}</id>", xml_escape(&res.lex)),
        _ => writeln!(out, "    <plainLiteral>{}</plainLiteral>", xml_escape(&res.lex)),
    }
}

fn dump_graph(
    out: &mut impl Write,
    engine: &mut Engine,
    graph: Rid,
) -> quadstore::Result<()> {
    let name = engine.resolve(&[graph])?.remove(0);
    writeln!(out, "  <graph>")?;
    writeln!(out, "    <uri>{}</uri>", xml_escape(&name.lex))?;

    let result = engine.bind(&BindQuery::everything().with_models(vec![graph]))?;
    let cols = result.columns();
    if cols.len() == 4 {
        for i in 0..cols[0].len() {
            let terms = engine.resolve(&[cols[1][i], cols[2][i], cols[3][i]])?;
            writeln!(out, "   <triple>")?;
            for term in &terms {
                write_term(out, term)?;
            }
            writeln!(out, "   </triple>")?;
        }
    }

    writeln!(out, "  </graph>")?;

    Ok(())
}

fn run(args: &Args) -> quadstore::Result<()> {
    let config = Config::from_env();

    let md = Metadata::open(
        &quadstore::file::metadata_path(&config, &args.kbname),
        false,
    )?;

    let sink: Box<dyn Write> = if args.output == "-" {
        Box::new(std::io::stdout())
    } else {
        Box::new(std::fs::File::create(&args.output)?)
    };
    let mut out = BufWriter::new(sink);

    writeln!(out, r#"<?xml version="1.0" encoding="utf-8"?>"#)?;
    writeln!(out, r#"<TriX xmlns="http://www.w3.org/2004/03/trix/trix-1/">"#)?;

    for seg in md.get_int_vector(metadata::MD_SEGMENT_P) {
        let mut engine = Engine::open(&config, &args.kbname, seg)?;

        let graphs = {
            let result = engine.bind(&BindQuery {
                flags: quadstore::BindFlags::MODEL
                    | quadstore::BindFlags::DISTINCT
                    | quadstore::BindFlags::BY_SUBJECT,
                ..BindQuery::everything()
            })?;
            result.columns().first().cloned().unwrap_or_default()
        };

        for graph in graphs {
            dump_graph(&mut out, &mut engine, graph)?;
        }
    }

    writeln!(out, "</TriX>")?;
    out.flush()?;

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("qs-dump: {e}");
        std::process::exit(1);
    }
}
