use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use log::{error, info};
use tree_sitter::Tree;

use fuzz_advisor::api::{self, AppState};
use fuzz_advisor::calltree::CallTree;
use fuzz_advisor::coverage::CoverageRunner;
use fuzz_advisor::profile;

#[derive(Debug, Parser)]
#[command(name = "fuzz-advisor", about = "Coverage-guided constraint ranking for fuzzer fleets")]
struct Cli {
    /// Instrumented target binary
    #[arg(long)]
    program: Option<PathBuf>,
    /// Function profile document for the target
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Call tree dump for the target
    #[arg(long)]
    calltree: Option<PathBuf>,
    /// Port for the HTTP server
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    simple_logger::init_with_level(log::Level::Info)?;

    let (Some(program), Some(profile_path), Some(calltree_path)) =
        (cli.program, cli.profile, cli.calltree)
    else {
        Cli::command().print_help()?;
        return Ok(());
    };

    for tool in ["llvm-profdata", "llvm-cov"] {
        if !tool_on_path(tool) {
            error!("{tool} is not installed");
            std::process::exit(1);
        }
    }

    let program_profile = profile::parse_profile(&profile_path)?;
    let index = program_profile.index();
    info!(
        "profile loaded: {} functions from {}",
        program_profile.functions.len(),
        program_profile.fuzzer_filename
    );

    let call_tree = CallTree::parse(&calltree_path, &index)?;
    info!(
        "call tree loaded: {} nodes, {} levels, max complexity {}",
        call_tree.len(),
        call_tree.max_depth,
        call_tree.max_cyclomatic_complexity
    );

    let runner = CoverageRunner::new(&program)?;

    // Seed replay: learn the instrumented source files once, parse each into
    // a syntax tree, then zero the counts so the first real report diffs
    // against an all-cold baseline.
    let mut baseline = runner.bootstrap_line_coverage()?;
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&tree_sitter_cpp::LANGUAGE.into())?;
    let mut syntax_trees: HashMap<String, Tree> = HashMap::new();
    let mut sources: HashMap<String, Vec<u8>> = HashMap::new();
    for file in &mut baseline {
        let code = file.origin_code();
        if let Some(tree) = parser.parse(&code, None) {
            syntax_trees.insert(file.file.clone(), tree);
            sources.insert(file.file.clone(), code);
        }
        file.reset_cov();
    }
    info!("syntax trees built for {} source files", syntax_trees.len());

    let state = Arc::new(AppState::new(
        runner,
        Arc::new(call_tree),
        syntax_trees,
        sources,
        baseline,
    ));
    api::serve(state, cli.port).await?;
    Ok(())
}

fn tool_on_path(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(tool).is_file())
}
