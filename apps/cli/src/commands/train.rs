//! Train command implementation.
//!
//! Resolves the run configuration from the optional TOML run file and the flags, runs
//! the session on a blocking task, and turns Ctrl-C into a cooperative cancel.

use clap::{Args, ValueEnum};
use colored::Colorize;
use dftr_training::{
    exit_codes, run_session, CancellationFlag, Collaborators, ConfigResolver, ModeFlags, Overrides, RunSummary,
    TrainingError, TrainingResult,
};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Variable listing the devices this process may use.
const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";
const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// Where the dataset, network and evaluator come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Synthetic frames and a linear offset head, for smoke runs
    Reference,
    /// Externally linked Linemod loader and DFTr network
    Linemod,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Object class (ape, benchvise, cam, can, cat, driller, duck, eggbox, glue, holepuncher, iron, lamp, phone)
    #[arg(long, default_value = "ape")]
    cls: String,

    /// TOML run file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Collaborator set
    #[arg(long, value_enum, default_value_t = Backend::Linemod)]
    backend: Backend,

    /// Checkpoint to resume from or evaluate
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long = "checkpoint-interval", alias = "checkpoint_interval")]
    checkpoint_interval: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long = "lr-decay", alias = "lr_decay")]
    lr_decay: Option<f64>,

    #[arg(long = "decay-step", alias = "decay_step")]
    decay_step: Option<f64>,

    /// step or cyclic
    #[arg(long = "lr-policy", alias = "lr_policy")]
    lr_policy: Option<String>,

    #[arg(long = "weight-decay", alias = "weight_decay")]
    weight_decay: Option<f64>,

    #[arg(long = "bn-momentum", alias = "bn_momentum")]
    bn_momentum: Option<f64>,

    #[arg(long = "bn-decay", alias = "bn_decay")]
    bn_decay: Option<f64>,

    #[arg(long = "mini-batch-size", alias = "mini_batch_size")]
    mini_batch_size: Option<usize>,

    /// Comma-separated device ids, e.g. 0,1
    #[arg(long)]
    gpu: Option<String>,

    /// Number of devices (processes) in the run
    #[arg(long)]
    gpus: Option<usize>,

    /// This process's rank
    #[arg(long = "local-rank", alias = "local_rank")]
    local_rank: Option<usize>,

    /// Rendezvous host of rank 0
    #[arg(long = "master-addr", alias = "master_addr")]
    master_addr: Option<String>,

    /// Rendezvous port of rank 0
    #[arg(long = "master-port", alias = "master_port")]
    master_port: Option<u16>,

    /// Seconds to wait for every rank to join
    #[arg(long = "init-timeout", alias = "init_timeout")]
    init_timeout: Option<u64>,

    /// Train with a fixed loss scale of 1
    #[arg(long = "no-mixed-precision", alias = "no_mixed_precision")]
    no_mixed_precision: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Batches per epoch in debug mode
    #[arg(long = "debug-batches", alias = "debug_batches")]
    debug_batches: Option<usize>,

    /// Epochs in debug mode
    #[arg(long = "debug-epochs", alias = "debug_epochs")]
    debug_epochs: Option<usize>,

    /// Short run without validation
    #[arg(long)]
    debug: bool,

    /// Mean losses over the test split
    #[arg(long)]
    test: bool,

    /// Pose accuracy from network predictions
    #[arg(long = "test-pose", alias = "test_pose")]
    test_pose: bool,

    /// Pose accuracy from ground-truth targets
    #[arg(long = "test-gt", alias = "test_gt")]
    test_gt: bool,

    /// Pose accuracy plus a pose_metrics.json report
    #[arg(long = "cal-metrics", alias = "cal_metrics")]
    cal_metrics: bool,

    /// Colored segmentation PNGs
    #[arg(long = "view-dpt", alias = "view_dpt")]
    view_dpt: bool,

    /// Same as --test
    #[arg(long = "eval-net", alias = "eval_net")]
    eval_net: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl TrainArgs {
    fn modes(&self) -> ModeFlags {
        ModeFlags {
            debug: self.debug,
            test: self.test,
            test_pose: self.test_pose,
            test_gt: self.test_gt,
            cal_metrics: self.cal_metrics,
            view_dpt: self.view_dpt,
            eval_net: self.eval_net,
        }
    }

    fn rendezvous(&self) -> TrainingResult<Option<SocketAddr>> {
        if self.master_addr.is_none() && self.master_port.is_none() {
            return Ok(None);
        }
        let host = self.master_addr.as_deref().unwrap_or(DEFAULT_MASTER_ADDR);
        let port = self.master_port.unwrap_or(DEFAULT_MASTER_PORT);
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| TrainingError::Configuration(format!("rendezvous address {host}:{port}: {e}")))?;
        addrs
            .next()
            .map(Some)
            .ok_or_else(|| TrainingError::Configuration(format!("rendezvous address {host}:{port} did not resolve")))
    }

    /// Flag values only; absent flags leave lower layers untouched.
    fn overrides(&self, visible_devices: Option<String>) -> TrainingResult<Overrides> {
        Ok(Overrides {
            weight_decay: self.weight_decay,
            lr: self.lr,
            lr_decay: self.lr_decay,
            decay_step: self.decay_step,
            lr_policy: self.lr_policy.as_deref().map(str::parse).transpose()?,
            bn_momentum: self.bn_momentum,
            bn_decay: self.bn_decay,
            mini_batch_size: self.mini_batch_size,
            checkpoint: self.checkpoint.clone(),
            checkpoint_interval: self.checkpoint_interval,
            epochs: self.epochs,
            gpu: self.gpu.clone(),
            gpus: self.gpus,
            local_rank: self.local_rank,
            visible_devices,
            rendezvous: self.rendezvous()?,
            init_timeout_secs: self.init_timeout,
            mixed_precision: self.no_mixed_precision.then_some(false),
            debug_batches: self.debug_batches,
            debug_epochs: self.debug_epochs,
            seed: self.seed,
            // Groups are structured; they come from the run file only.
            param_groups: None,
            modes: self.modes(),
        })
    }
}

/// Execute the train command, returning the process exit code.
pub async fn execute(root: PathBuf, args: TrainArgs) -> anyhow::Result<i32> {
    let visible = std::env::var(VISIBLE_DEVICES_VAR).ok().filter(|v| !v.trim().is_empty());
    let json = args.json;

    let (config, collaborators) = match prepare(&root, &args, visible) {
        Ok(prepared) => prepared,
        Err(e) => return Ok(report_error(&e)),
    };

    let cancel = CancellationFlag::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        })
    };

    let result = tokio::task::spawn_blocking(move || run_session(&config, collaborators, None, cancel)).await;
    watcher.abort();

    match result {
        Ok(Ok(summary)) => {
            print_summary(&summary, json)?;
            Ok(exit_codes::SUCCESS)
        }
        Ok(Err(e)) => Ok(report_error(&e)),
        Err(join) => {
            error!(error = %join, "training task failed");
            eprintln!("{} training task failed: {}", "error:".red().bold(), join);
            Ok(exit_codes::FAILURE)
        }
    }
}

fn prepare(
    root: &Path,
    args: &TrainArgs,
    visible: Option<String>,
) -> TrainingResult<(dftr_training::RunConfig, Collaborators)> {
    let flags = args.overrides(visible)?;
    let overrides = match &args.config {
        Some(path) => Overrides::from_toml_file(path)?.merge(flags),
        None => flags,
    };

    let capabilities = match args.backend {
        Backend::Reference => dftr_training::Capabilities::all(),
        Backend::Linemod => Collaborators::none().capabilities(),
    };
    let config = ConfigResolver::new(root.to_path_buf(), capabilities).resolve(&args.cls, &overrides)?;
    let collaborators = match args.backend {
        Backend::Reference => {
            Collaborators::reference(config.cls, config.seed, config.schedule.mini_batch_size)
        }
        Backend::Linemod => Collaborators::none(),
    };
    Ok((config, collaborators))
}

fn report_error(e: &TrainingError) -> i32 {
    let code = e.exit_code();
    error!(error = %e, exit_code = code, "run failed");
    eprintln!("{} {}", "error:".red().bold(), e);
    code
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let mode = summary.mode.map_or_else(|| "run".to_string(), |m| m.to_string());
    println!("{} {}", "✓".green(), format!("{mode} finished").bold());
    if summary.global_step > 0 {
        println!("  Epochs: {}  Steps: {}", summary.epochs_completed, summary.global_step);
    }
    if summary.overflow_skips > 0 {
        println!("  Overflow skips: {}", summary.overflow_skips.to_string().yellow());
    }
    if let Some(best) = summary.best_metric {
        println!("  Best validation loss: {}", format!("{best:.6}").cyan());
    }
    if let Some(pose) = &summary.pose {
        println!(
            "  ADD(-S) accuracy: {} over {} instances",
            format!("{:.2}%", pose.overall.accuracy * 100.0).cyan(),
            pose.overall.instances
        );
    }
    for path in &summary.checkpoints {
        println!("  Checkpoint: {}", path.display().to_string().dimmed());
    }
    if !summary.images.is_empty() {
        println!("  Images: {}", summary.images.len());
    }
    Ok(())
}
