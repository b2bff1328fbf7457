//! `kill` role: deliver a signal to a process inside the pod

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::info;

use crate::errors::WfError;

/// Signal from a number (`15`) or a name (`TERM`, `SIGTERM`)
pub fn parse_signal(raw: &str) -> Result<Signal, WfError> {
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).map_err(|e| WfError::BadRequest(format!("invalid signal {}: {}", raw, e)));
    }
    let upper = raw.to_uppercase();
    let name = if upper.starts_with("SIG") { upper } else { format!("SIG{}", upper) };
    name.parse::<Signal>()
        .map_err(|e| WfError::BadRequest(format!("invalid signal {}: {}", raw, e)))
}

/// Arguments `[-s] SIGNAL PID`
pub fn parse_args(args: &[String]) -> Result<(Signal, Pid), WfError> {
    let args: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "-s" && *a != "--")
        .collect();
    let [signal, pid] = args.as_slice() else {
        return Err(WfError::BadRequest("usage: kill [-s] SIGNAL PID".to_string()));
    };
    let pid: i32 = pid
        .parse()
        .map_err(|_| WfError::BadRequest(format!("invalid pid {}", pid)))?;
    Ok((parse_signal(signal)?, Pid::from_raw(pid)))
}

pub fn kill(args: &[String]) -> Result<(), WfError> {
    let (sig, pid) = parse_args(args)?;
    info!("sending {} to pid {}", sig, pid);
    signal::kill(pid, sig).map_err(|e| WfError::Internal(format!("failed to signal pid {}: {}", pid, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&args(&["15", "1"])).unwrap(), (Signal::SIGTERM, Pid::from_raw(1)));
        assert_eq!(parse_args(&args(&["-s", "KILL", "7"])).unwrap(), (Signal::SIGKILL, Pid::from_raw(7)));
        assert_eq!(parse_signal("sigusr2").unwrap(), Signal::SIGUSR2);
        assert!(parse_args(&args(&["15"])).is_err());
        assert!(parse_args(&args(&["BOGUS", "1"])).is_err());
    }

    #[tokio::test]
    async fn test_kill_child() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap().to_string();
        kill(&args(&["TERM", &pid])).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
