use quarry_client::Engine;
use quarry_common::Settings;
use quarry_planner::{explain_logical, explain_physical, CompilationOptions, ProcessingStage};
use quarry_storage::Catalog;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args
        .first()
        .map(|a| a == "--help" || a == "-h")
        .unwrap_or(false)
    {
        print_usage();
        return Ok(());
    }

    let opts = parse_opts(&args)?;
    let settings = match &opts.settings {
        Some(path) => Settings::load_from_json(path)?,
        None => Settings::default(),
    };
    let engine = Engine::new(settings)?;
    if let Some(catalog_path) = &opts.catalog {
        engine.register_catalog(&Catalog::load_from_json(catalog_path)?)?;
    }

    let options = CompilationOptions::default()
        .with_only_analyze(opts.analyze)
        .with_stage(opts.stage);
    let mut interpreter = engine.compile(&opts.sql, options)?;
    println!("query: {}", interpreter.query());
    println!("header:");
    for field in interpreter.schema()?.fields() {
        println!(
            "  {}: {:?}{}",
            field.name(),
            field.data_type(),
            if field.is_nullable() { " (nullable)" } else { "" }
        );
    }

    if opts.physical {
        let result = interpreter.execute()?;
        println!("physical plan:");
        print!("{}", explain_physical(result.pipeline().root()));
        if let Some(quota) = result.quota() {
            println!("quota: {}", quota.name());
        }
    } else {
        let plan = interpreter.extract_query_plan()?;
        println!("logical plan:");
        print!("{}", explain_logical(plan.root()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Opts {
    sql: String,
    catalog: Option<String>,
    settings: Option<String>,
    analyze: bool,
    physical: bool,
    stage: ProcessingStage,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            sql: "SELECT 1".to_string(),
            catalog: None,
            settings: None,
            analyze: false,
            physical: false,
            stage: ProcessingStage::Complete,
        }
    }
}

fn parse_opts(args: &[String]) -> Result<Opts, Box<dyn std::error::Error>> {
    // Short form:
    //   quarry-client "SELECT 1"
    // Full form:
    //   quarry-client explain --sql "SELECT ..." [--catalog path] [--settings path]
    //     [--analyze] [--physical] [--stage fetch_columns|mergeable|complete]
    if args.first().map(|a| a.as_str()) != Some("explain") {
        let mut opts = Opts::default();
        if let Some(sql) = args.first() {
            opts.sql = sql.clone();
        }
        return Ok(opts);
    }

    let mut opts = Opts::default();
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--sql" => {
                i += 1;
                opts.sql = args.get(i).cloned().ok_or("missing value for --sql")?;
            }
            "--catalog" => {
                i += 1;
                opts.catalog = Some(args.get(i).cloned().ok_or("missing value for --catalog")?);
            }
            "--settings" => {
                i += 1;
                opts.settings = Some(
                    args.get(i)
                        .cloned()
                        .ok_or("missing value for --settings")?,
                );
            }
            "--stage" => {
                i += 1;
                opts.stage = match args.get(i).map(|s| s.as_str()) {
                    Some("fetch_columns") => ProcessingStage::FetchColumns,
                    Some("mergeable") => ProcessingStage::WithMergeableState,
                    Some("complete") => ProcessingStage::Complete,
                    Some(other) => return Err(format!("unknown stage: {other}").into()),
                    None => return Err("missing value for --stage".into()),
                };
            }
            "--analyze" => opts.analyze = true,
            "--physical" => opts.physical = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
        i += 1;
    }
    Ok(opts)
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  quarry-client \"<SQL>\"");
    eprintln!("  quarry-client explain --sql \"<SQL>\" [--catalog PATH] [--settings PATH]");
    eprintln!("                [--analyze] [--physical] [--stage fetch_columns|mergeable|complete]");
}
