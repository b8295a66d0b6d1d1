//! Resource discovery from the host process table.
//!
//! `lkvm list` prints only pid, name and state. The allocation lives on the
//! VM process command line (`lkvm run --mem 512 --cpus 1 ...`), so instances
//! discovered by a listing are completed from there.

use sysinfo::{Pid, System};
use tracing::debug;

use crate::types::{Record, ResourceSpec};

/// Extract memory and vCPU count from a VM command line.
///
/// Accepts `--mem N`, `--mem=N`, `-m N` and the `--cpus`/`-c` equivalents.
pub fn resources_from_cmdline<S: AsRef<str>>(args: &[S]) -> Option<ResourceSpec> {
    let mut memory_mib = None;
    let mut vcpus = None;
    let mut iter = args.iter().map(AsRef::as_ref);

    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (arg, None),
        };
        match flag {
            "--mem" | "-m" => {
                memory_mib = inline.or_else(|| iter.next()).and_then(|v| v.parse().ok());
            }
            "--cpus" | "-c" => {
                vcpus = inline.or_else(|| iter.next()).and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }

    Some(ResourceSpec {
        memory_mib: memory_mib?,
        vcpus: vcpus?,
    })
}

fn cmdline_resources(sys: &System, pid: u32) -> Option<ResourceSpec> {
    let process = sys.process(Pid::from_u32(pid))?;
    let args: Vec<String> = process
        .cmd()
        .iter()
        .map(|s| s.to_string_lossy().to_string())
        .collect();
    resources_from_cmdline(&args)
}

/// Fill in memory and vCPUs for records whose listing lacked them.
///
/// The process table is read once, and only if some record needs it.
/// Returns how many records were completed.
pub fn complete_records(records: &mut [Record]) -> usize {
    let pending = |record: &Record| record.resources().is_none() && record.pid.is_some();
    if !records.iter().any(pending) {
        return 0;
    }

    let mut sys = System::new_all();
    sys.refresh_all();

    let mut completed = 0;
    for record in records.iter_mut().filter(|r| pending(r)) {
        let Some(pid) = record.pid else { continue };
        if let Some(resources) = cmdline_resources(&sys, pid) {
            record.memory_mib.get_or_insert(resources.memory_mib);
            record.vcpus.get_or_insert(resources.vcpus);
            completed += 1;
        }
    }

    debug!(completed, "Completed records from process command lines");
    completed
}
