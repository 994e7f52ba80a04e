use chatbattery::config::{RankingConfig, ScorerConfig};
use chatbattery::core::ranking::parse_candidate_list;
use chatbattery::utils::{logger, validation::Validate};
use chatbattery::LocalStorage;
use clap::Parser;

#[derive(Parser)]
#[command(name = "rank")]
#[command(about = "Score and rank candidate formulas in consecutive passes")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "ranking.toml")]
    config: String,

    /// Override ranking.input_file from config
    #[arg(long = "input_file", alias = "input-file")]
    input_file: Option<String>,

    /// Override ranking.output_dir from config
    #[arg(long = "output_dir", alias = "output-dir")]
    output_dir: Option<String>,

    /// Dry run - show the pass plan without scoring anything
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // 初始化日誌
    logger::init_cli_logger(args.verbose);

    tracing::info!("🚀 Starting ranking");
    tracing::info!("📁 Loading configuration from: {}", args.config);

    let mut config = match RankingConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 命令列覆蓋設定
    if let Some(input_file) = args.input_file {
        config.ranking.input_file = input_file;
    }
    if let Some(output_dir) = args.output_dir {
        config.ranking.output_dir = output_dir;
    }

    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    display_plan(&config);

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - No scoring will occur");
        return Ok(());
    }

    let text = match tokio::fs::read_to_string(&config.ranking.input_file).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("❌ Cannot read '{}': {}", config.ranking.input_file, e);
            std::process::exit(3);
        }
    };
    let candidates = parse_candidate_list(&text);
    tracing::info!("📥 {} candidates to rank", candidates.len());

    let execution_id = chrono::Utc::now().format("rank_%Y%m%d_%H%M%S").to_string();
    let storage = LocalStorage::new(config.ranking.output_dir.clone());
    let sequence = config.build_sequence(storage, execution_id);

    match sequence.execute_all(candidates).await {
        Ok(results) => {
            let summary = sequence.execution_summary(&results);
            tracing::info!("📊 Ranking summary: {:?}", summary);
            println!("✅ Ranking completed: {} passes", results.len());
            for result in &results {
                println!(
                    "  {} -> {} candidates in {}",
                    result.pass_name,
                    result.candidates.len(),
                    result.output_path
                );
            }
        }
        Err(e) => {
            tracing::error!(
                "❌ Ranking failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            let exit_code = e.exit_code();
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}

fn display_plan(config: &RankingConfig) {
    println!("📋 Ranking Plan:");
    println!("  Input: {}", config.ranking.input_file);
    println!("  Output dir: {}", config.ranking.output_dir);
    println!("  Task: {}", config.task());
    println!(
        "  Order: {}",
        if config.descending() { "descending" } else { "ascending" }
    );
    for (index, pass) in config.passes.iter().enumerate() {
        let scorer = match &pass.scorer {
            ScorerConfig::Command { program, args, .. } => {
                format!("command: {} {}", program, args.join(" "))
            }
            ScorerConfig::Capacity { task } => format!("capacity ({})", task),
        };
        println!(
            "  {}. {}{} -> {} [{}]{}",
            index + 1,
            pass.name,
            if pass.is_enabled() { "" } else { " (disabled)" },
            pass.output_name(index),
            scorer.trim_end(),
            pass.keep_top
                .map(|n| format!(", keep top {}", n))
                .unwrap_or_default()
        );
    }
}
