//! Run configuration and its resolution from class id + overrides.
//!
//! Precedence, lowest first: built-in defaults, an optional TOML run file, CLI flags.
//! The resolved [`RunConfig`] is immutable and shared by reference with every component.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::optimizer::ParamGroup;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// The Linemod object classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Ape,
    Benchvise,
    Cam,
    Can,
    Cat,
    Driller,
    Duck,
    Eggbox,
    Glue,
    Holepuncher,
    Iron,
    Lamp,
    Phone,
}

impl ObjectClass {
    pub const ALL: [Self; 13] = [
        Self::Ape,
        Self::Benchvise,
        Self::Cam,
        Self::Can,
        Self::Cat,
        Self::Driller,
        Self::Duck,
        Self::Eggbox,
        Self::Glue,
        Self::Holepuncher,
        Self::Iron,
        Self::Lamp,
        Self::Phone,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ape => "ape",
            Self::Benchvise => "benchvise",
            Self::Cam => "cam",
            Self::Can => "can",
            Self::Cat => "cat",
            Self::Driller => "driller",
            Self::Duck => "duck",
            Self::Eggbox => "eggbox",
            Self::Glue => "glue",
            Self::Holepuncher => "holepuncher",
            Self::Iron => "iron",
            Self::Lamp => "lamp",
            Self::Phone => "phone",
        }
    }

    /// Object id in the Linemod dataset.
    #[must_use]
    pub const fn dataset_id(self) -> u32 {
        match self {
            Self::Ape => 1,
            Self::Benchvise => 2,
            Self::Cam => 4,
            Self::Can => 5,
            Self::Cat => 6,
            Self::Driller => 8,
            Self::Duck => 9,
            Self::Eggbox => 10,
            Self::Glue => 11,
            Self::Holepuncher => 12,
            Self::Iron => 13,
            Self::Lamp => 14,
            Self::Phone => 15,
        }
    }

    /// Zero-padded directory name, e.g. `01`.
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("{:02}", self.dataset_id())
    }

    /// Objects evaluated with ADD-S.
    #[must_use]
    pub const fn is_symmetric(self) -> bool {
        matches!(self, Self::Eggbox | Self::Glue)
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObjectClass {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|c| c.name() == needle).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|c| c.name()).collect();
            TrainingError::Configuration(format!(
                "unknown object class '{}' (known: {})",
                s,
                known.join(", ")
            ))
        })
    }
}

/// What the driver does for the lifetime of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Debug,
    Test,
    TestPose,
    TestGroundTruth,
    CalibrateMetrics,
    ViewDepth,
}

impl Mode {
    #[must_use]
    pub const fn is_training(self) -> bool {
        matches!(self, Self::Train | Self::Debug)
    }

    /// Modes that cannot run without the pose evaluator.
    #[must_use]
    pub const fn requires_evaluator(self) -> bool {
        matches!(self, Self::TestPose | Self::TestGroundTruth | Self::CalibrateMetrics)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Debug => "debug",
            Self::Test => "test",
            Self::TestPose => "test_pose",
            Self::TestGroundTruth => "test_gt",
            Self::CalibrateMetrics => "cal_metrics",
            Self::ViewDepth => "view_dpt",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutually exclusive mode switches as they arrive from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeFlags {
    pub debug: bool,
    pub test: bool,
    pub test_pose: bool,
    pub test_gt: bool,
    pub cal_metrics: bool,
    pub view_dpt: bool,
    pub eval_net: bool,
}

impl ModeFlags {
    fn union(self, other: Self) -> Self {
        Self {
            debug: self.debug || other.debug,
            test: self.test || other.test,
            test_pose: self.test_pose || other.test_pose,
            test_gt: self.test_gt || other.test_gt,
            cal_metrics: self.cal_metrics || other.cal_metrics,
            view_dpt: self.view_dpt || other.view_dpt,
            eval_net: self.eval_net || other.eval_net,
        }
    }

    /// Collapses the flags into one [`Mode`]; no flag means `Train`.
    pub fn resolve(self) -> TrainingResult<Mode> {
        let set: Vec<(&str, Mode)> = [
            (self.debug, "debug", Mode::Debug),
            (self.test, "test", Mode::Test),
            (self.eval_net, "eval_net", Mode::Test),
            (self.test_pose, "test_pose", Mode::TestPose),
            (self.test_gt, "test_gt", Mode::TestGroundTruth),
            (self.cal_metrics, "cal_metrics", Mode::CalibrateMetrics),
            (self.view_dpt, "view_dpt", Mode::ViewDepth),
        ]
        .into_iter()
        .filter(|(on, _, _)| *on)
        .map(|(_, name, mode)| (name, mode))
        .collect();

        match set.as_slice() {
            [] => Ok(Mode::Train),
            [(_, mode)] => Ok(*mode),
            many => {
                let names: Vec<&str> = many.iter().map(|(n, _)| *n).collect();
                Err(TrainingError::Configuration(format!(
                    "mode flags are mutually exclusive, got: {}",
                    names.join(", ")
                )))
            }
        }
    }
}

/// Learning-rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrPolicy {
    /// `lr0 * gamma^floor(step * batch / decay_step)`, clipped from below.
    StepDecay,
    /// Triangular cycle between the clip value and `lr0`.
    Cyclic,
}

impl FromStr for LrPolicy {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "step" | "step_decay" => Ok(Self::StepDecay),
            "cyclic" | "clr" => Ok(Self::Cyclic),
            other => Err(TrainingError::Configuration(format!("unknown lr policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub policy: LrPolicy,
    pub learning_rate: f64,
    pub lr_decay: f64,
    pub decay_step: f64,
    pub weight_decay: f64,
    pub lr_clip: f64,
    pub bn_momentum: f64,
    pub bn_decay: f64,
    pub bn_clip: f64,
    pub mini_batch_size: usize,
    /// Divides the cyclic half period.
    pub clr_div: u64,
    /// Explicit cyclic half period in steps; derived from the epoch budget when absent.
    pub cyclic_step_size: Option<u64>,
    /// Prefix groups with their own rate multiplier and weight decay; the rest of the
    /// parameters fall into a catch-all group.
    #[serde(default)]
    pub param_groups: Vec<ParamGroup>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            policy: LrPolicy::StepDecay,
            learning_rate: 1e-2,
            lr_decay: 0.5,
            decay_step: 2e5,
            weight_decay: 0.0,
            lr_clip: 1e-5,
            bn_momentum: 0.9,
            bn_decay: 0.5,
            bn_clip: 1e-2,
            mini_batch_size: 8,
            clr_div: 6,
            cyclic_step_size: None,
            param_groups: Vec::new(),
        }
    }
}

/// Dynamic loss-scaling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionConfig {
    /// When false the loss scale stays at 1.0; non-finite steps are still skipped.
    pub enabled: bool,
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Consecutive clean steps before the scale grows.
    pub growth_interval: u32,
    pub min_scale: f32,
    /// Fraction of skipped steps per epoch above which a warning is emitted.
    pub skip_warn_ratio: f64,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            skip_warn_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Address rank 0 listens on.
    pub rendezvous: SocketAddr,
    pub init_timeout_secs: u64,
    /// Bound on a single collective operation.
    pub op_timeout_secs: u64,
}

impl DistributedConfig {
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rendezvous: SocketAddr::from(([127, 0, 0, 1], 29500)),
            init_timeout_secs: 60,
            op_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLimits {
    pub max_batches: usize,
    pub max_epochs: usize,
}

impl Default for DebugLimits {
    fn default() -> Self {
        Self { max_batches: 10, max_epochs: 1 }
    }
}

/// Which optional collaborators are linked into this process, resolved once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub dataset_provider: bool,
    pub network: bool,
    pub evaluator: bool,
}

impl Capabilities {
    #[must_use]
    pub const fn all() -> Self {
        Self { dataset_provider: true, network: true, evaluator: true }
    }
}

/// Immutable configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub cls: ObjectClass,
    /// Background plus the target object.
    pub n_objects: usize,
    /// Usable device indices, one process per entry up to `world_size`.
    pub devices: Vec<usize>,
    pub world_size: usize,
    pub local_rank: usize,
    pub mode: Mode,
    pub schedule: ScheduleConfig,
    pub precision: PrecisionConfig,
    pub distributed: DistributedConfig,
    pub epochs: usize,
    pub checkpoint: Option<PathBuf>,
    /// Save an epoch checkpoint every this many epochs (the final epoch is always saved).
    pub checkpoint_interval: usize,
    pub debug: DebugLimits,
    pub seed: u64,
    pub layout: TrainingLayout,
    pub capabilities: Capabilities,
}

impl RunConfig {
    /// Epochs the driver actually runs, after the debug cap.
    #[must_use]
    pub fn effective_epochs(&self) -> usize {
        if self.mode == Mode::Debug { self.epochs.min(self.debug.max_epochs) } else { self.epochs }
    }

    /// Batches per epoch cap, if any.
    #[must_use]
    pub fn batch_cap(&self) -> Option<usize> {
        (self.mode == Mode::Debug).then_some(self.debug.max_batches)
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.local_rank == 0
    }

    /// Writes the resolved configuration next to the logs.
    pub fn write_to_log_dir(&self) -> TrainingResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.layout.run_config_path(), json)?;
        Ok(())
    }
}

/// Independently optional run parameters.
///
/// Deserializable from a TOML run file; CLI flags are layered on top with
/// [`Overrides::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Overrides {
    pub weight_decay: Option<f64>,
    pub lr: Option<f64>,
    pub lr_decay: Option<f64>,
    pub decay_step: Option<f64>,
    pub lr_policy: Option<LrPolicy>,
    pub bn_momentum: Option<f64>,
    pub bn_decay: Option<f64>,
    pub mini_batch_size: Option<usize>,
    pub checkpoint: Option<PathBuf>,
    pub checkpoint_interval: Option<usize>,
    pub epochs: Option<usize>,
    /// Comma-separated device list, e.g. `0,1`.
    pub gpu: Option<String>,
    pub gpus: Option<usize>,
    pub local_rank: Option<usize>,
    /// Value of the device-visibility variable, read by the caller.
    pub visible_devices: Option<String>,
    pub rendezvous: Option<SocketAddr>,
    pub init_timeout_secs: Option<u64>,
    pub mixed_precision: Option<bool>,
    pub debug_batches: Option<usize>,
    pub debug_epochs: Option<usize>,
    pub seed: Option<u64>,
    pub param_groups: Option<Vec<ParamGroup>>,
    pub modes: ModeFlags,
}

impl Overrides {
    /// Loads overrides from a TOML run file.
    pub fn from_toml_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::Configuration(format!("failed to read run file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            TrainingError::Configuration(format!("failed to parse run file {}: {}", path.display(), e))
        })
    }

    /// Layers `higher` over `self`; any value set in `higher` wins.
    #[must_use]
    pub fn merge(self, higher: Self) -> Self {
        Self {
            weight_decay: higher.weight_decay.or(self.weight_decay),
            lr: higher.lr.or(self.lr),
            lr_decay: higher.lr_decay.or(self.lr_decay),
            decay_step: higher.decay_step.or(self.decay_step),
            lr_policy: higher.lr_policy.or(self.lr_policy),
            bn_momentum: higher.bn_momentum.or(self.bn_momentum),
            bn_decay: higher.bn_decay.or(self.bn_decay),
            mini_batch_size: higher.mini_batch_size.or(self.mini_batch_size),
            checkpoint: higher.checkpoint.or(self.checkpoint),
            checkpoint_interval: higher.checkpoint_interval.or(self.checkpoint_interval),
            epochs: higher.epochs.or(self.epochs),
            gpu: higher.gpu.or(self.gpu),
            gpus: higher.gpus.or(self.gpus),
            local_rank: higher.local_rank.or(self.local_rank),
            visible_devices: higher.visible_devices.or(self.visible_devices),
            rendezvous: higher.rendezvous.or(self.rendezvous),
            init_timeout_secs: higher.init_timeout_secs.or(self.init_timeout_secs),
            mixed_precision: higher.mixed_precision.or(self.mixed_precision),
            debug_batches: higher.debug_batches.or(self.debug_batches),
            debug_epochs: higher.debug_epochs.or(self.debug_epochs),
            seed: higher.seed.or(self.seed),
            param_groups: higher.param_groups.or(self.param_groups),
            modes: self.modes.union(higher.modes),
        }
    }
}

/// Parses a comma-separated device list. Empty entries are ignored.
pub fn parse_device_list(list: &str) -> TrainingResult<Vec<usize>> {
    let mut devices = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let id = token.parse::<usize>().map_err(|_| {
            TrainingError::Configuration(format!("invalid device id '{token}' in device list '{list}'"))
        })?;
        if !devices.contains(&id) {
            devices.push(id);
        }
    }
    Ok(devices)
}

/// Builds a [`RunConfig`] from a class id and overrides.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    root: PathBuf,
    capabilities: Capabilities,
}

impl ConfigResolver {
    /// `root` is the project directory the `train_log` tree is created under.
    #[must_use]
    pub fn new(root: PathBuf, capabilities: Capabilities) -> Self {
        Self { root, capabilities }
    }

    /// Validates everything first, then creates the log/checkpoint directories.
    pub fn resolve(&self, cls: &str, overrides: &Overrides) -> TrainingResult<RunConfig> {
        let cls: ObjectClass = cls.parse()?;
        let mode = overrides.modes.resolve()?;
        let schedule = resolve_schedule(overrides)?;

        let world_size = overrides.gpus.unwrap_or(1);
        if world_size == 0 {
            return Err(TrainingError::Configuration("device count must be >= 1".to_string()));
        }

        let mut devices = parse_device_list(overrides.gpu.as_deref().unwrap_or("0"))?;
        if let Some(visible) = overrides.visible_devices.as_deref() {
            let visible = parse_device_list(visible)?;
            devices.retain(|d| visible.contains(d));
        }
        if world_size > 1 {
            if devices.is_empty() {
                return Err(TrainingError::Configuration(format!(
                    "{world_size} devices requested but the device list yields no usable devices"
                )));
            }
            if devices.len() < world_size {
                return Err(TrainingError::Configuration(format!(
                    "{} devices requested but only {} usable: {:?}",
                    world_size,
                    devices.len(),
                    devices
                )));
            }
            devices.truncate(world_size);
        } else if devices.is_empty() {
            devices.push(0);
        } else {
            devices.truncate(1);
        }

        let epochs = overrides.epochs.unwrap_or(1000);
        if epochs == 0 {
            return Err(TrainingError::Configuration("epochs must be >= 1".to_string()));
        }
        let checkpoint_interval = overrides.checkpoint_interval.unwrap_or(1);
        if checkpoint_interval == 0 {
            return Err(TrainingError::Configuration("checkpoint_interval must be >= 1".to_string()));
        }

        let defaults = DebugLimits::default();
        let debug = DebugLimits {
            max_batches: overrides.debug_batches.unwrap_or(defaults.max_batches).max(1),
            max_epochs: overrides.debug_epochs.unwrap_or(defaults.max_epochs).max(1),
        };

        let mut distributed = DistributedConfig::default();
        if let Some(addr) = overrides.rendezvous {
            distributed.rendezvous = addr;
        }
        if let Some(secs) = overrides.init_timeout_secs {
            distributed.init_timeout_secs = secs;
        }

        let precision = PrecisionConfig {
            enabled: overrides.mixed_precision.unwrap_or(true),
            ..PrecisionConfig::default()
        };

        let layout = TrainingLayout::new(self.root.clone(), cls.name());
        layout.ensure_dirs()?;

        Ok(RunConfig {
            run_id: Uuid::new_v4().to_string(),
            cls,
            n_objects: 2,
            devices,
            world_size,
            local_rank: overrides.local_rank.unwrap_or(0),
            mode,
            schedule,
            precision,
            distributed,
            epochs,
            checkpoint: overrides.checkpoint.clone(),
            checkpoint_interval,
            debug,
            seed: overrides.seed.unwrap_or(0),
            layout,
            capabilities: self.capabilities,
        })
    }
}

fn resolve_schedule(overrides: &Overrides) -> TrainingResult<ScheduleConfig> {
    let defaults = ScheduleConfig::default();
    let schedule = ScheduleConfig {
        policy: overrides.lr_policy.unwrap_or(defaults.policy),
        learning_rate: overrides.lr.unwrap_or(defaults.learning_rate),
        lr_decay: overrides.lr_decay.unwrap_or(defaults.lr_decay),
        decay_step: overrides.decay_step.unwrap_or(defaults.decay_step),
        weight_decay: overrides.weight_decay.unwrap_or(defaults.weight_decay),
        bn_momentum: overrides.bn_momentum.unwrap_or(defaults.bn_momentum),
        bn_decay: overrides.bn_decay.unwrap_or(defaults.bn_decay),
        mini_batch_size: overrides.mini_batch_size.unwrap_or(defaults.mini_batch_size),
        param_groups: overrides.param_groups.clone().unwrap_or_default(),
        ..defaults
    };

    if !schedule.learning_rate.is_finite() || schedule.learning_rate <= 0.0 {
        return Err(TrainingError::Configuration("lr must be > 0".to_string()));
    }
    if !(schedule.lr_decay > 0.0 && schedule.lr_decay <= 1.0) {
        return Err(TrainingError::Configuration("lr_decay must be in (0, 1]".to_string()));
    }
    if !schedule.decay_step.is_finite() || schedule.decay_step <= 0.0 {
        return Err(TrainingError::Configuration("decay_step must be > 0".to_string()));
    }
    if !schedule.weight_decay.is_finite() || schedule.weight_decay < 0.0 {
        return Err(TrainingError::Configuration("weight_decay must be >= 0".to_string()));
    }
    if !(0.0..=1.0).contains(&schedule.bn_momentum) {
        return Err(TrainingError::Configuration("bn_momentum must be in [0, 1]".to_string()));
    }
    if !(schedule.bn_decay > 0.0 && schedule.bn_decay <= 1.0) {
        return Err(TrainingError::Configuration("bn_decay must be in (0, 1]".to_string()));
    }
    if schedule.mini_batch_size == 0 {
        return Err(TrainingError::Configuration("mini_batch_size must be >= 1".to_string()));
    }
    for group in &schedule.param_groups {
        if group.prefix.as_deref().is_some_and(str::is_empty) {
            return Err(TrainingError::Configuration(format!("param group '{}' has an empty prefix", group.name)));
        }
        if !group.lr_scale.is_finite() || group.lr_scale <= 0.0 {
            return Err(TrainingError::Configuration(format!("param group '{}': lr_scale must be > 0", group.name)));
        }
        if !group.weight_decay.is_finite() || group.weight_decay < 0.0 {
            return Err(TrainingError::Configuration(format!(
                "param group '{}': weight_decay must be >= 0",
                group.name
            )));
        }
    }
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver(temp: &TempDir) -> ConfigResolver {
        ConfigResolver::new(temp.path().to_path_buf(), Capabilities::all())
    }

    #[test]
    fn test_unknown_class_fails_before_creating_dirs() {
        let temp = TempDir::new().unwrap();
        let err = resolver(&temp).resolve("teapot", &Overrides::default()).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
        assert!(!temp.path().join("train_log").exists());
    }

    #[test]
    fn test_resolve_defaults_for_ape() {
        let temp = TempDir::new().unwrap();
        let config = resolver(&temp).resolve("ape", &Overrides::default()).unwrap();

        assert_eq!(config.cls, ObjectClass::Ape);
        assert_eq!(config.mode, Mode::Train);
        assert_eq!(config.world_size, 1);
        assert_eq!(config.devices, vec![0]);
        assert_eq!(config.epochs, 1000);
        assert!((config.schedule.learning_rate - 1e-2).abs() < f64::EPSILON);
        assert!(config.layout.checkpoints_dir().is_dir());
    }

    #[test]
    fn test_multi_device_without_usable_devices_fails() {
        let temp = TempDir::new().unwrap();
        let overrides = Overrides {
            gpus: Some(2),
            gpu: Some("0,1".to_string()),
            visible_devices: Some("3".to_string()),
            ..Default::default()
        };
        let err = resolver(&temp).resolve("cat", &overrides).unwrap_err();
        assert!(err.to_string().contains("no usable devices"));
    }

    #[test]
    fn test_mode_flags_are_exclusive() {
        let flags = ModeFlags { debug: true, test_pose: true, ..Default::default() };
        assert!(flags.resolve().is_err());
        assert_eq!(ModeFlags { eval_net: true, ..Default::default() }.resolve().unwrap(), Mode::Test);
        assert_eq!(ModeFlags::default().resolve().unwrap(), Mode::Train);
    }

    #[test]
    fn test_merge_prefers_higher_layer() {
        let file = Overrides { lr: Some(0.1), epochs: Some(5), ..Default::default() };
        let cli = Overrides { lr: Some(0.2), ..Default::default() };
        let merged = file.merge(cli);
        assert_eq!(merged.lr, Some(0.2));
        assert_eq!(merged.epochs, Some(5));
    }

    #[test]
    fn test_overrides_from_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(&path, "lr = 0.001\nlr_policy = \"cyclic\"\n[modes]\ndebug = true\n").unwrap();
        let overrides = Overrides::from_toml_file(&path).unwrap();
        assert_eq!(overrides.lr, Some(0.001));
        assert_eq!(overrides.lr_policy, Some(LrPolicy::Cyclic));
        assert!(overrides.modes.debug);
    }

    #[test]
    fn test_param_groups_from_run_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(
            &path,
            "[[param_groups]]\nname = \"backbone\"\nprefix = \"backbone.\"\nlr_scale = 0.1\nweight_decay = 1e-4\n",
        )
        .unwrap();
        let overrides = Overrides::from_toml_file(&path).unwrap();
        let config = resolver(&temp).resolve("ape", &overrides).unwrap();

        let groups = &config.schedule.param_groups;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].prefix.as_deref(), Some("backbone."));
        assert!((groups[0].lr_scale - 0.1).abs() < f64::EPSILON);
        assert!((groups[0].weight_decay - 1e-4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_param_group_is_rejected() {
        let temp = TempDir::new().unwrap();
        let group = ParamGroup { lr_scale: 0.0, ..ParamGroup::catch_all(0.0, 0.0) };
        let overrides = Overrides { param_groups: Some(vec![group]), ..Default::default() };
        let err = resolver(&temp).resolve("ape", &overrides).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(msg) if msg.contains("lr_scale")));
    }

    #[test]
    fn test_parse_device_list() {
        assert_eq!(parse_device_list("0, 1,,1").unwrap(), vec![0, 1]);
        assert!(parse_device_list("gpu0").is_err());
    }

    #[test]
    fn test_debug_caps_epochs() {
        let temp = TempDir::new().unwrap();
        let overrides = Overrides {
            epochs: Some(50),
            debug_batches: Some(2),
            modes: ModeFlags { debug: true, ..Default::default() },
            ..Default::default()
        };
        let config = resolver(&temp).resolve("ape", &overrides).unwrap();
        assert_eq!(config.effective_epochs(), 1);
        assert_eq!(config.batch_cap(), Some(2));
    }
}
