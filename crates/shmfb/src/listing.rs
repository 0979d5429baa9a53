//! Host-wide enumeration of SysV shared memory segments.
//!
//! Linux exposes the segment table natively in `/proc/sysvipc/shm`; elsewhere the
//! `ipcs` tool is the only source and its column layout is platform specific.

use std::io;
use std::process::Command;

use common::types::ListerKind;
use tracing::debug;

use crate::error::{Result, ShmError};

/// One row of the host segment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub shm_id: i32,
    pub size: usize,
    /// Permission bits (`0o777` mask).
    pub perms: u32,
    /// Attach count when the source reports it.
    pub n_attach: Option<u64>,
}

pub trait SegmentLister: Send + Sync {
    fn name(&self) -> &'static str;
    fn list(&self) -> Result<Vec<SegmentInfo>>;
}

/// Pick the lister for `kind` on the current host.
pub fn lister_for(kind: ListerKind) -> Box<dyn SegmentLister> {
    match kind {
        ListerKind::Proc => Box::new(ProcSysvipc::default()),
        ListerKind::Ipcs => platform_ipcs(),
        ListerKind::Auto => {
            if cfg!(target_os = "linux") {
                Box::new(ProcSysvipc::default())
            } else {
                platform_ipcs()
            }
        }
    }
}

fn platform_ipcs() -> Box<dyn SegmentLister> {
    if cfg!(target_os = "macos") {
        Box::new(IpcsMacos)
    } else {
        Box::new(IpcsLinux)
    }
}

// === /proc/sysvipc/shm ===

pub const PROC_SYSVIPC_SHM: &str = "/proc/sysvipc/shm";

pub struct ProcSysvipc {
    pub path: String,
}

impl Default for ProcSysvipc {
    fn default() -> Self {
        Self {
            path: PROC_SYSVIPC_SHM.to_string(),
        }
    }
}

impl SegmentLister for ProcSysvipc {
    fn name(&self) -> &'static str {
        "proc"
    }

    fn list(&self) -> Result<Vec<SegmentInfo>> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ShmError::ToolUnavailable {
            tool: self.path.clone(),
            source,
        })?;
        parse_proc_sysvipc(&text)
    }
}

/// Columns: key shmid perms size cpid lpid nattch ... ; perms in octal. One header line.
pub fn parse_proc_sysvipc(text: &str) -> Result<Vec<SegmentInfo>> {
    let mut out = Vec::new();
    for line in text.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 7 {
            return Err(parse_failed(line, "expected at least 7 columns"));
        }
        out.push(SegmentInfo {
            shm_id: parse_num(line, cols[1], "shmid")?,
            perms: parse_octal(line, cols[2])? & 0o777,
            size: parse_num(line, cols[3], "size")?,
            n_attach: Some(parse_num(line, cols[6], "nattch")?),
        });
    }
    Ok(out)
}

// === ipcs ===

fn run_ipcs(args: &[&str]) -> Result<String> {
    let tool = format!("ipcs {}", args.join(" "));
    let output = Command::new("ipcs")
        .args(args)
        .output()
        .map_err(|source| ShmError::ToolUnavailable {
            tool: tool.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(ShmError::ToolUnavailable {
            tool,
            source: io::Error::new(
                io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
        });
    }
    debug!(%tool, bytes = output.stdout.len(), "segment listing");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `ipcs -m` as printed by util-linux.
pub struct IpcsLinux;

impl SegmentLister for IpcsLinux {
    fn name(&self) -> &'static str {
        "ipcs"
    }

    fn list(&self) -> Result<Vec<SegmentInfo>> {
        parse_ipcs_linux(&run_ipcs(&["-m"])?)
    }
}

/// Columns: key shmid owner perms bytes nattch [status]; two header lines.
pub fn parse_ipcs_linux(text: &str) -> Result<Vec<SegmentInfo>> {
    let mut out = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()).skip(2) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 {
            return Err(parse_failed(line, "expected at least 6 columns"));
        }
        out.push(SegmentInfo {
            shm_id: parse_num(line, cols[1], "shmid")?,
            perms: parse_octal(line, cols[3])? & 0o777,
            size: parse_num(line, cols[4], "bytes")?,
            n_attach: Some(parse_num(line, cols[5], "nattch")?),
        });
    }
    Ok(out)
}

/// `ipcs -m -b` as printed by macOS.
pub struct IpcsMacos;

impl SegmentLister for IpcsMacos {
    fn name(&self) -> &'static str {
        "ipcs"
    }

    fn list(&self) -> Result<Vec<SegmentInfo>> {
        parse_ipcs_macos(&run_ipcs(&["-m", "-b"])?)
    }
}

/// Columns: T ID KEY MODE OWNER GROUP SEGSZ; three header lines. Only `m` rows
/// are kept, and only mode `--rw-r--r--` maps to perms 0644 (others report 0).
pub fn parse_ipcs_macos(text: &str) -> Result<Vec<SegmentInfo>> {
    let mut out = Vec::new();
    for line in text.lines().skip(3).filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 7 {
            return Err(parse_failed(line, "expected at least 7 columns"));
        }
        if cols[0] != "m" {
            continue;
        }
        out.push(SegmentInfo {
            shm_id: parse_num(line, cols[1], "ID")?,
            perms: if cols[3] == "--rw-r--r--" { 0o644 } else { 0 },
            size: parse_num(line, cols[6], "SEGSZ")?,
            n_attach: None,
        });
    }
    Ok(out)
}

// === helpers ===

fn parse_failed(line: &str, reason: impl Into<String>) -> ShmError {
    ShmError::ParseFailed {
        line: line.to_string(),
        reason: reason.into(),
    }
}

fn parse_num<T: std::str::FromStr>(line: &str, col: &str, what: &str) -> Result<T> {
    col.parse()
        .map_err(|_| parse_failed(line, format!("bad {what} column {col:?}")))
}

fn parse_octal(line: &str, col: &str) -> Result<u32> {
    u32::from_str_radix(col, 8).map_err(|_| parse_failed(line, format!("bad perms column {col:?}")))
}
