//! Thin client-side subcommands over the daemon socket. Rendering is plain
//! prints; the daemon owns all the actual work.

use std::path::Path;

use anyhow::Result;

use gpmd::daemon::client::DaemonClient;
use gpmd::daemon::{DaemonConfig, DaemonServer};
use gpmd::Service;

pub async fn cmd_run() -> Result<()> {
    let config = DaemonConfig::default();
    println!("Running gpmd in foreground (Ctrl+C to stop)");
    println!("  Root:   {}", config.root_dir.display());
    println!("  Socket: {}", config.socket_path.display());
    println!("  PID:    {}", config.pid_path.display());
    println!();

    let server = DaemonServer::new(config);
    server.run().await
}

pub async fn cmd_info() -> Result<()> {
    let info = DaemonClient::new().info().await?;
    println!("pid:     {}", info.pid);
    println!("version: {}", info.version);
    println!("os:      {}/{}", info.os, info.arch);
    println!("uptime:  {}", format_duration(info.uptime_secs));
    println!(
        "stat:    cpu {:.1}%, mem {} bytes ({:.1}%)",
        info.stat.cpu_percent, info.stat.memory, info.stat.mem_percent
    );
    Ok(())
}

pub async fn cmd_list() -> Result<()> {
    let (services, total) = DaemonClient::new().list().await?;
    println!(
        "{:<20} {:<10} {:<8} {:<10} {:<8} {}",
        "NAME", "STATUS", "PID", "VERSION", "CPU%", "MEMORY"
    );
    for svc in services {
        println!(
            "{:<20} {:<10} {:<8} {:<10} {:<8.1} {}",
            svc.name,
            svc.status.as_str(),
            svc.pid,
            svc.version,
            svc.stat.cpu_percent,
            svc.stat.memory
        );
    }
    println!("total: {total}");
    Ok(())
}

pub async fn cmd_get(name: &str) -> Result<()> {
    print_service(&DaemonClient::new().get(name).await?);
    Ok(())
}

pub async fn cmd_start(name: &str) -> Result<()> {
    print_service(&DaemonClient::new().start(name).await?);
    Ok(())
}

pub async fn cmd_stop(name: &str) -> Result<()> {
    print_service(&DaemonClient::new().stop(name).await?);
    Ok(())
}

pub async fn cmd_restart(name: &str) -> Result<()> {
    print_service(&DaemonClient::new().restart(name).await?);
    Ok(())
}

pub async fn cmd_delete(name: &str) -> Result<()> {
    let svc = DaemonClient::new().delete(name).await?;
    println!("Deleted service '{}'", svc.name);
    Ok(())
}

pub async fn cmd_install(name: &str, bin: &str, package: &str, version: &str) -> Result<()> {
    let spec = Service::new(name, bin).version(version);
    let svc = DaemonClient::new()
        .install(spec, Path::new(package))
        .await?;
    println!("Installed '{}' at version {}", svc.name, svc.version);
    Ok(())
}

pub async fn cmd_upgrade(name: &str, version: &str, package: &str) -> Result<()> {
    let svc = DaemonClient::new()
        .upgrade(name, version, Path::new(package))
        .await?;
    println!("Upgraded '{}' to version {}", svc.name, svc.version);
    Ok(())
}

pub async fn cmd_rollback(name: &str, version: &str) -> Result<()> {
    let svc = DaemonClient::new().rollback(name, version).await?;
    println!("Rolled back '{}' to version {}", svc.name, svc.version);
    Ok(())
}

pub async fn cmd_versions(name: &str) -> Result<()> {
    let versions = DaemonClient::new().list_versions(name).await?;
    for v in versions {
        let ts = chrono::DateTime::from_timestamp(v.timestamp, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        println!("{:<12} {}", v.version, ts);
    }
    Ok(())
}

pub async fn cmd_forget(name: &str, version: &str) -> Result<()> {
    DaemonClient::new().forget(name, version).await?;
    println!("Forgot version {version} of '{name}'");
    Ok(())
}

pub async fn cmd_push(local: &str, remote: &str) -> Result<()> {
    DaemonClient::new().push(Path::new(local), remote).await?;
    println!("Pushed {local} -> {remote}");
    Ok(())
}

pub async fn cmd_logs(name: &str, lines: u64, follow: bool) -> Result<()> {
    let mut rx = DaemonClient::new().watch_log(name, lines, follow).await?;
    while let Some(line) = rx.recv().await {
        if let Some(err) = line.error {
            eprintln!("log stream error: {err}");
            break;
        }
        println!("{}", line.text);
    }
    Ok(())
}

pub async fn cmd_shutdown(force: bool) -> Result<()> {
    let client = DaemonClient::new();
    if !client.is_running().await {
        println!("Daemon is not running");
        return Ok(());
    }
    client.shutdown(!force).await?;
    println!("Shutdown requested");
    Ok(())
}

fn print_service(svc: &Service) {
    println!("name:    {}", svc.name);
    println!("status:  {}", svc.status.as_str());
    println!("pid:     {}", svc.pid);
    println!("version: {}", svc.version);
    println!("bin:     {}", svc.bin);
    if !svc.args.is_empty() {
        println!("args:    {}", svc.args.join(" "));
    }
    if !svc.dir.is_empty() {
        println!("dir:     {}", svc.dir);
    }
    if !svc.msg.is_empty() {
        println!("msg:     {}", svc.msg);
    }
    println!(
        "stat:    cpu {:.1}%, mem {} bytes ({:.1}%)",
        svc.stat.cpu_percent, svc.stat.memory, svc.stat.mem_percent
    );
}

fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}
