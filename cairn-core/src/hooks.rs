//! Declarative stage execution around lifecycle steps.

use crate::chroot::Chroot;
use crate::config::Config;
use crate::constants;
use crate::errors::{err, ErrorKind, KindContext, Result};
use cairn_hal::SystemHal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Runs a named stage against a set of config paths or URIs.
pub trait StageRunner: Send + Sync {
    fn run(&self, stage: &str, paths: &[String]) -> Result<()>;
}

/// [`StageRunner`] backed by the `yip` CLI.
pub struct YipStageRunner {
    hal: Arc<dyn SystemHal>,
}

impl YipStageRunner {
    pub fn new(hal: Arc<dyn SystemHal>) -> Self {
        Self { hal }
    }
}

impl StageRunner for YipStageRunner {
    fn run(&self, stage: &str, paths: &[String]) -> Result<()> {
        let mut args = vec!["-s", stage];
        args.extend(paths.iter().map(String::as_str));
        self.hal.run("yip", &args).kind(ErrorKind::Hook)?;
        Ok(())
    }
}

/// Value of the setup key on the kernel command line, if any.
fn cmdline_setup_uri(cmdline: &str) -> Option<String> {
    cmdline.split_whitespace().find_map(|word| {
        let (key, value) = word.split_once('=')?;
        (key == constants::SETUP_CMDLINE_KEY && !value.is_empty()).then(|| value.to_string())
    })
}

/// Run `<stage>.before`, `<stage>` and `<stage>.after` over the stage paths.
///
/// A setup URI from the kernel command line gets its own `.before` and
/// `.after` runs around the others. Every run is attempted; failures are
/// collected and only returned in strict mode.
pub fn run_stage(cfg: &Config, stage: &str, strict: bool) -> Result<()> {
    let before = format!("{stage}.before");
    let after = format!("{stage}.after");
    let paths = cfg.stage_paths();
    let mut failures: Vec<String> = Vec::new();

    let setup_uri = match cfg.hal.proc_cmdline() {
        Ok(cmdline) => cmdline_setup_uri(&cmdline),
        Err(e) => {
            failures.push(format!("reading kernel cmdline: {e}"));
            None
        }
    };
    if let Some(uri) = &setup_uri {
        log::debug!("found {} on cmdline: {}", constants::SETUP_CMDLINE_KEY, uri);
    }

    let mut runs: Vec<(&str, Vec<String>)> = Vec::new();
    if let Some(uri) = &setup_uri {
        runs.push((before.as_str(), vec![uri.clone()]));
    }
    runs.push((before.as_str(), paths.clone()));
    runs.push((stage, paths.clone()));
    runs.push((after.as_str(), paths));
    if let Some(uri) = setup_uri {
        runs.push((after.as_str(), vec![uri]));
    }

    for (name, paths) in runs {
        if let Err(e) = cfg.stage_runner.run(name, &paths) {
            failures.push(format!("{name}: {e:#}"));
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    if !strict {
        log::info!("Some errors found but were ignored. Enable strict mode to fail on those");
        for failure in &failures {
            log::warn!("{}", failure);
        }
        return Ok(());
    }
    Err(err(ErrorKind::Hook, failures.join("; ")))
}

/// Run the `hook` stage; errors only propagate when `strict`.
pub fn hook(cfg: &Config, hook: &str, strict: bool) -> Result<()> {
    log::info!("Running {} hook", hook);
    run_stage(cfg, hook, strict)
}

/// Run [`hook`] with `dir` as root, bind-mounting `bind_mounts` into it.
pub fn chroot_hook(
    cfg: &Config,
    name: &str,
    strict: bool,
    dir: &Path,
    bind_mounts: &BTreeMap<PathBuf, PathBuf>,
) -> Result<()> {
    let mut chroot = Chroot::new(dir, &*cfg.hal);
    chroot.set_extra_mounts(bind_mounts.clone());
    chroot.run_callback(|| hook(cfg, name, strict))
}
