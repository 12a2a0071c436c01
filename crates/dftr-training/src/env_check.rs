//! Dataset and project-layout checks run before training.

use crate::config::ObjectClass;
use crate::error::exit_codes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Dataset root relative to the project root.
pub const DATASET_ROOT: &str = "datasets/linemod/Linemod_preprocessed";
pub const KEYPOINT_DIR: &str = "datasets/linemod/lm_obj_kps";
pub const MODEL_CODE_FILES: [(&str, &str); 3] = [
    ("models/ffb6d_linemod.py", "FFB6D model"),
    ("models/my_fusion_block/DFTr.py", "DFTr fusion block"),
    ("models/utils_my/iteration_decode_kps.py", "keypoint voting"),
];
pub const SCRIPT_FILES: [&str; 2] = ["train_linemod.py", "test_linemod.sh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    /// Failing this fails the whole report.
    Required,
    Informational,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckItem {
    pub section: String,
    pub label: String,
    pub passed: bool,
    pub level: CheckLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ObjectDataStatus {
    Complete,
    Partial { missing: Vec<String> },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDataCheck {
    pub cls: ObjectClass,
    pub dir: PathBuf,
    #[serde(flatten)]
    pub status: ObjectDataStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub project_root: PathBuf,
    pub objects: Vec<ObjectDataCheck>,
    pub items: Vec<CheckItem>,
    pub passed: bool,
}

impl EnvironmentReport {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.passed { exit_codes::SUCCESS } else { exit_codes::ENVIRONMENT_NOT_READY }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckItem> {
        self.items.iter().filter(|i| i.level == CheckLevel::Required && !i.passed)
    }
}

/// Inspects a project tree for the Linemod dataset, models and model code.
#[derive(Debug, Clone)]
pub struct EnvironmentChecker {
    project_root: PathBuf,
}

impl EnvironmentChecker {
    #[must_use]
    pub fn new(project_root: PathBuf) -> Self {
        Self { project_root }
    }

    #[must_use]
    pub fn dataset_root(&self) -> PathBuf {
        self.project_root.join(DATASET_ROOT)
    }

    #[must_use]
    pub fn run(&self) -> EnvironmentReport {
        let mut items = Vec::new();
        let root = self.dataset_root();
        let data_dir = root.join("data");
        let models_dir = root.join("models");

        for (label, path) in [("dataset root", &root), ("data directory", &data_dir), ("models directory", &models_dir)] {
            items.push(path_item("dataset", label, path, path.is_dir(), CheckLevel::Required));
        }

        let objects: Vec<ObjectDataCheck> = ObjectClass::ALL.iter().map(|cls| check_object(&data_dir, *cls)).collect();
        let complete = objects.iter().filter(|o| o.status == ObjectDataStatus::Complete).count();
        items.push(CheckItem {
            section: "objects".into(),
            label: format!("found {}/{} objects", complete, ObjectClass::ALL.len()),
            passed: complete == ObjectClass::ALL.len(),
            level: CheckLevel::Required,
            path: Some(data_dir.clone()),
            detail: None,
        });

        let models = ObjectClass::ALL
            .iter()
            .filter(|cls| models_dir.join(format!("obj_{}.ply", cls.dir_name())).is_file())
            .count();
        items.push(CheckItem {
            section: "models".into(),
            label: format!("found {}/{} PLY models", models, ObjectClass::ALL.len()),
            passed: models == ObjectClass::ALL.len(),
            level: CheckLevel::Required,
            path: Some(models_dir.clone()),
            detail: None,
        });
        items.push(models_info_item(&models_dir.join("models_info.yml")));

        let kps = self.project_root.join(KEYPOINT_DIR);
        items.push(path_item("keypoints", "keypoint directory", &kps, kps.is_dir(), CheckLevel::Informational));

        for (file, label) in MODEL_CODE_FILES {
            let path = self.project_root.join(file);
            items.push(path_item("model code", label, &path, path.is_file(), CheckLevel::Required));
        }
        for file in SCRIPT_FILES {
            let path = self.project_root.join(file);
            items.push(path_item("scripts", file, &path, path.is_file(), CheckLevel::Informational));
        }

        let passed = items.iter().all(|i| i.level == CheckLevel::Informational || i.passed);
        EnvironmentReport { project_root: self.project_root.clone(), objects, items, passed }
    }
}

fn path_item(section: &str, label: &str, path: &Path, passed: bool, level: CheckLevel) -> CheckItem {
    CheckItem {
        section: section.to_string(),
        label: label.to_string(),
        passed,
        level,
        path: Some(path.to_path_buf()),
        detail: None,
    }
}

fn check_object(data_dir: &Path, cls: ObjectClass) -> ObjectDataCheck {
    let dir = data_dir.join(cls.dir_name());
    let status = if dir.is_dir() {
        let missing: Vec<String> = ["rgb", "depth", "mask"]
            .into_iter()
            .filter(|sub| !dir.join(sub).is_dir())
            .chain(std::iter::once("gt.yml").filter(|f| !dir.join(f).is_file()))
            .map(str::to_string)
            .collect();
        if missing.is_empty() { ObjectDataStatus::Complete } else { ObjectDataStatus::Partial { missing } }
    } else {
        ObjectDataStatus::Missing
    };
    ObjectDataCheck { cls, dir, status }
}

/// `models_info.yml` is informational; its entry count is reported when it parses.
fn models_info_item(path: &Path) -> CheckItem {
    let (passed, detail) = match std::fs::read_to_string(path) {
        Err(_) => (false, Some("file not found".to_string())),
        Ok(content) => match serde_yaml::from_str::<serde_yaml::Value>(&content) {
            Ok(serde_yaml::Value::Mapping(m)) => (true, Some(format!("{} object entries", m.len()))),
            Ok(serde_yaml::Value::Sequence(s)) => (true, Some(format!("{} object entries", s.len()))),
            Ok(_) => (true, Some("0 object entries".to_string())),
            Err(e) => (false, Some(format!("parse error: {e}"))),
        },
    };
    CheckItem {
        section: "models".into(),
        label: "models_info.yml".into(),
        passed,
        level: CheckLevel::Informational,
        path: Some(path.to_path_buf()),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        let ds = root.join(DATASET_ROOT);
        for cls in ObjectClass::ALL {
            let dir = ds.join("data").join(cls.dir_name());
            for sub in ["rgb", "depth", "mask"] {
                std::fs::create_dir_all(dir.join(sub)).unwrap();
            }
            std::fs::write(dir.join("gt.yml"), "0: []\n").unwrap();
            std::fs::create_dir_all(ds.join("models")).unwrap();
            std::fs::write(ds.join("models").join(format!("obj_{}.ply", cls.dir_name())), "ply\n").unwrap();
        }
        for (file, _) in MODEL_CODE_FILES {
            let path = root.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "").unwrap();
        }
    }

    #[test]
    fn test_empty_tree_fails() {
        let temp = TempDir::new().unwrap();
        let report = EnvironmentChecker::new(temp.path().to_path_buf()).run();
        assert!(!report.passed);
        assert_eq!(report.exit_code(), exit_codes::ENVIRONMENT_NOT_READY);
        assert!(report.objects.iter().all(|o| o.status == ObjectDataStatus::Missing));
    }

    #[test]
    fn test_complete_tree_passes_without_informational_files() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let report = EnvironmentChecker::new(temp.path().to_path_buf()).run();
        assert!(report.passed, "failures: {:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(report.exit_code(), exit_codes::SUCCESS);
        let info = report.items.iter().find(|i| i.label == "models_info.yml").unwrap();
        assert!(!info.passed);
    }

    #[test]
    fn test_partial_object_and_models_info_count() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let ds = temp.path().join(DATASET_ROOT);
        std::fs::remove_dir_all(ds.join("data/06/mask")).unwrap();
        std::fs::write(ds.join("models/models_info.yml"), "1: {diameter: 102.1}\n2: {diameter: 247.5}\n").unwrap();

        let report = EnvironmentChecker::new(temp.path().to_path_buf()).run();
        assert!(!report.passed);
        let cat = report.objects.iter().find(|o| o.cls == ObjectClass::Cat).unwrap();
        assert_eq!(cat.status, ObjectDataStatus::Partial { missing: vec!["mask".to_string()] });
        let info = report.items.iter().find(|i| i.label == "models_info.yml").unwrap();
        assert_eq!(info.detail.as_deref(), Some("2 object entries"));
    }
}
