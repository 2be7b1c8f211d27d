// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::lab::{FrontendSettings, LabContext};
use haaukins_common::models::{
    ChallengeConfig, EnvVarConfig, ExerciseConfig, InstanceConfig, RecordConfig,
};
use haaukins_common::Tag;
use haaukins_virtual::testing::{FakeHypervisor, FakeRuntime};
use haaukins_virtual::vm::VmLibrary;
use std::io::Write;
use std::sync::Arc;

pub(crate) fn exercise(tag: &str, image: &str) -> ExerciseConfig {
    ExerciseConfig {
        tags: vec![Tag::new(tag).unwrap()],
        name: tag.to_uppercase(),
        instances: vec![InstanceConfig {
            image: image.to_string(),
            records: vec![RecordConfig {
                name: format!("{tag}.hkn"),
                kind: "A".to_string(),
                rdata: String::new(),
            }],
            flags: vec![ChallengeConfig {
                tag: Tag::new(tag).unwrap(),
                name: format!("{tag} challenge"),
                env_var: Some("APP_FLAG".to_string()),
                static_flag: None,
                points: 10,
            }],
            ..Default::default()
        }],
    }
}

pub(crate) fn ftp_exercise() -> ExerciseConfig {
    let mut conf = exercise("ftp", "aau/ftp");
    let instance = &mut conf.instances[0];
    instance.memory_mb = 64;
    instance.envs.push(EnvVarConfig {
        name: "MODE".to_string(),
        value: "anonymous".to_string(),
    });
    instance.flags.push(ChallengeConfig {
        tag: Tag::new("ftp-static").unwrap(),
        name: "Banner".to_string(),
        env_var: Some("BANNER_FLAG".to_string()),
        static_flag: Some("HKN{static}".to_string()),
        points: 5,
    });
    conf
}

/// A lab context on in-memory drivers with a `kali.ova` frontend image.
pub(crate) struct TestContext {
    pub runtime: Arc<FakeRuntime>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub context: LabContext,
    _dir: tempfile::TempDir,
}

pub(crate) fn context() -> TestContext {
    let dir = tempfile::tempdir().unwrap();
    let mut file = std::fs::File::create(dir.path().join("kali.ova")).unwrap();
    file.write_all(b"kali").unwrap();

    let runtime = Arc::new(FakeRuntime::default());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let context = LabContext {
        runtime: runtime.clone(),
        library: Arc::new(VmLibrary::new(hypervisor.clone(), dir.path())),
        host_ip: "172.17.0.1".to_string(),
        settings: FrontendSettings::default(),
    };
    TestContext {
        runtime,
        hypervisor,
        context,
        _dir: dir,
    }
}
