//! `train`: one-shot training run, publishing the resulting model if it
//! passes the acceptance gate.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use txn_ml_pipeline::config::Config;
use txn_ml_pipeline::db::Db;
use txn_ml_pipeline::encoder::Encoder;
use txn_ml_pipeline::registry::Registry;
use txn_ml_pipeline::trainer::Trainer;

#[derive(Parser)]
#[command(name = "train")]
struct Args {
    /// Skip publishing even if the run passes the acceptance gate.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let db = Db::open(&config.database_path)?;
    let registry = Registry::open(&config.registry_root)?;
    let encoder_config = Encoder::default_config(config.num_hash_buckets, config.hash_seed);

    let trainer = Trainer::new(db.clone());
    let outcome = trainer.run(encoder_config, &config.trainer)?;

    tracing::info!(
        run_id = %outcome.run.run_id,
        passed_gate = outcome.run.passed_gate,
        f1_macro = outcome.run.metrics.f1_macro,
        "training run complete"
    );

    let mut deployed = false;
    if outcome.run.passed_gate && !args.dry_run {
        if let (Some(model), Some(calibrators)) = (&outcome.model, &outcome.calibrators) {
            registry.publish(
                &outcome.run.run_id,
                &outcome.classes,
                &outcome.encoder_config,
                model,
                calibrators,
                &outcome.run.metrics,
            )?;
            db.mark_training_run_deployed(&outcome.run.run_id)?;
            deployed = true;
        }
    }

    println!(
        "{}",
        serde_json::json!({
            "run_id": outcome.run.run_id,
            "passed_gate": outcome.run.passed_gate,
            "deployed": deployed,
            "f1_macro": outcome.run.metrics.f1_macro,
            "rows_train": outcome.run.rows_train,
            "rows_val": outcome.run.rows_val,
            "dropped_classes": outcome.run.dropped_classes,
            "error": outcome.run.error,
        })
    );
    Ok(())
}
