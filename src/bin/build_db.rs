use chatbattery::core::retrieval::RetrievalBuildPipeline;
use chatbattery::utils::logger;
use chatbattery::{BatteryTask, LocalStorage, StageEngine};
use clap::Parser;

#[derive(Parser)]
#[command(name = "build_db")]
#[command(about = "Build a formula,capacity retrieval DB from an ICSD export")]
struct Args {
    /// ICSD export (.csv / .tsv) or newline-delimited formulas
    #[arg(long = "input_file", alias = "input-file")]
    input_file: String,

    /// 101 for the Li DB, 102 for the Na DB
    #[arg(long = "task_index", alias = "task-index", default_value_t = 101)]
    task_index: u32,

    /// Formula column in the CSV/TSV (inferred when omitted)
    #[arg(long = "formula_column", alias = "formula-column")]
    formula_column: Option<String>,

    /// Defaults to data/Li_battery/preprocessed.csv or data/Na_battery/preprocessed.csv
    #[arg(long = "output_file", alias = "output-file")]
    output_file: Option<String>,

    /// Drop exact duplicate formula strings, keeping the first
    #[arg(long = "deduplicate_exact", alias = "deduplicate-exact")]
    deduplicate_exact: bool,

    /// Optional CSV report of formulas that could not be processed
    #[arg(long = "errors_file", alias = "errors-file")]
    errors_file: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // 初始化日誌
    logger::init_cli_logger(args.verbose);

    let task = match BatteryTask::from_task_id(args.task_index) {
        Ok(task) => task,
        Err(e) => {
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(1);
        }
    };
    tracing::info!(
        "🔋 Building retrieval DB for task {} ({})",
        task.task_id(),
        task.carrier_element()
    );

    let pipeline = RetrievalBuildPipeline::new(LocalStorage::new(""), &args.input_file, task)
        .with_output_file(args.output_file.clone())
        .with_formula_column(args.formula_column.clone())
        .with_exact_dedup(args.deduplicate_exact)
        .with_errors_file(args.errors_file.clone());
    let engine = StageEngine::new("build_db", pipeline);

    match engine.run().await {
        Ok(outcome) => {
            println!("📥 Input formulas: {}", outcome.extracted);
            println!("✅ Output rows: {} -> {}", outcome.kept, outcome.output_path);
            if outcome.rejected > 0 {
                println!("⚠️ Skipped rows with errors: {}", outcome.rejected);
            }
        }
        Err(e) => {
            tracing::error!(
                "❌ Build failed: {} (Category: {:?}, Severity: {:?})",
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
