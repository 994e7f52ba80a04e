use chatbattery::core::dedup::DedupPipeline;
use chatbattery::utils::{logger, validation::validate_range};
use chatbattery::{LocalStorage, StageEngine};
use clap::Parser;

#[derive(Parser)]
#[command(name = "deduplicate")]
#[command(about = "Drop invalid and duplicate formulas from a candidate list")]
struct Args {
    /// Newline-delimited candidate formulas
    #[arg(long = "input_file", alias = "input-file")]
    input_file: String,

    /// Where to write the kept formulas
    #[arg(long = "output_file", alias = "output-file")]
    output_file: String,

    /// Atomic fraction tolerance for treating two formulas as the same material
    #[arg(long, default_value_t = 0.0)]
    tolerance: f64,

    /// Optional CSV report of lines that are not valid formulas
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

    if let Err(e) = validate_range("tolerance", args.tolerance, 0.0, 1.0) {
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    let pipeline = DedupPipeline::new(LocalStorage::new(""), &args.input_file, &args.output_file)
        .with_tolerance(args.tolerance)
        .with_errors_file(args.errors_file.clone());
    let engine = StageEngine::new("deduplicate", pipeline);

    match engine.run().await {
        Ok(outcome) => {
            println!(
                "✅ Kept {} of {} formulas ({} invalid) -> {}",
                outcome.kept, outcome.extracted, outcome.rejected, outcome.output_path
            );
        }
        Err(e) => {
            tracing::error!(
                "❌ Deduplication failed: {} (Category: {:?}, Severity: {:?})",
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
