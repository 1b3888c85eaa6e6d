//! Entry point for the fleetwatch CLI. Parses args, resolves the gateway profile and
//! prints a line per live tick until Ctrl-C.

use anyhow::{bail, Context};
use fleetwatch::config::{
    load_profiles, save_profiles, ProfileEntry, ProfileRequest, ResolveProfile,
};
use fleetwatch::dashboard::{Dashboard, EntityStatus, FleetOverview};
use fleetwatch::install::InstallStatus;
use fleetwatch::ranking::DEFAULT_TOP_N;
use fleetwatch::source::WsSource;
use fleetwatch::types::{Axis, EntityId, Metric};
use fleetwatch::util::{human_kb, truncate_middle};
use fleetwatch::window::{RankWindow, TimeWindow};
use std::env;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE_FLAGS: &str = concat!(
    "[--profile NAME|-P NAME] [--token TOKEN] [--server ADDR]... [--select ADDR] ",
    "[--install ADDR] [--window 30min|1h|3h|6h|12h|24h] ",
    "[--rank-cpu 1min|10min|30min] [--rank-ram 1min|10min|30min] ",
    "[--save] [--dry-run] [--once] [ws://HOST:PORT/ws]"
);

#[derive(Debug, Default)]
struct ParsedArgs {
    url: Option<String>,
    profile: Option<String>,
    token: Option<String>,
    servers: Vec<String>,
    select: Option<String>,
    install: Option<String>,
    window: TimeWindow,
    rank_cpu: RankWindow,
    rank_ram: RankWindow,
    save: bool,
    dry_run: bool,
    once: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "fleetwatch".into());
    let usage = format!("Usage: {prog} {USAGE_FLAGS}");
    let mut p = ParsedArgs::default();

    fn value(flag: &str, v: Option<String>) -> Result<String, String> {
        v.filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{flag} needs a value"))
    }

    while let Some(arg) = it.next() {
        // --flag=value
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut next = |inline: Option<String>| inline.or_else(|| it.next());
        match flag.as_str() {
            "-h" | "--help" => return Err(usage),
            "--profile" | "-P" => p.profile = Some(value(&flag, next(inline))?),
            "--token" => p.token = Some(value(&flag, next(inline))?),
            "--server" => p.servers.push(value(&flag, next(inline))?),
            "--select" => p.select = Some(value(&flag, next(inline))?),
            "--install" => p.install = Some(value(&flag, next(inline))?),
            "--window" => p.window = value(&flag, next(inline))?.parse()?,
            "--rank-cpu" => p.rank_cpu = value(&flag, next(inline))?.parse()?,
            "--rank-ram" => p.rank_ram = value(&flag, next(inline))?.parse()?,
            "--save" => p.save = true,
            "--dry-run" => p.dry_run = true,
            "--once" => p.once = true,
            _ if p.url.is_none() && !arg.starts_with('-') => p.url = Some(arg),
            _ => return Err(format!("Unexpected argument '{arg}'. {usage}")),
        }
    }
    Ok(p)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let Some(profile) = resolve_profile(&parsed)? else {
        return Ok(());
    };
    if parsed.dry_run {
        println!("gateway {}", profile.url);
        return Ok(());
    }
    run(parsed, profile).await
}

/// Turn `--profile`/url/token into connection settings, persisting new or changed
/// profiles. `None` means there is nothing to connect to.
fn resolve_profile(parsed: &ParsedArgs) -> anyhow::Result<Option<ProfileEntry>> {
    let profiles_file = load_profiles();
    let req = ProfileRequest {
        profile_name: parsed.profile.clone(),
        url: parsed.url.clone(),
        token: parsed.token.clone(),
    };
    let mut profiles_mut = profiles_file.clone();
    let entry = match req.resolve(&profiles_file) {
        ResolveProfile::Direct(entry) => {
            if let Some(name) = parsed.profile.as_ref() {
                let write = match profiles_mut.profiles.get(name) {
                    None => true,
                    Some(existing) if *existing != entry => {
                        parsed.save
                            || prompt_yes_no(&format!(
                                "Overwrite existing profile '{name}'? [y/N]: "
                            ))
                    }
                    Some(_) => false,
                };
                if write {
                    profiles_mut.profiles.insert(name.clone(), entry.clone());
                    save_profiles(&profiles_mut).context("saving profiles")?;
                    info!(profile = %name, "profile saved");
                }
            }
            entry
        }
        ResolveProfile::Loaded(entry) => entry,
        ResolveProfile::PromptSelect(names) => {
            eprintln!("Select profile:");
            for (i, n) in names.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, n);
            }
            let line = prompt_string("Enter number (or blank to abort): ")?;
            let chosen = line
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| names.get(i))
                .and_then(|n| profiles_file.profiles.get(n));
            match chosen {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        }
        ResolveProfile::Missing(name) => {
            bail!("profile '{name}' does not exist; pass a gateway url to create it")
        }
        ResolveProfile::None => {
            eprintln!("No URL provided and no profiles to select.");
            return Ok(None);
        }
    };
    Ok(Some(entry))
}

async fn run(parsed: ParsedArgs, profile: ProfileEntry) -> anyhow::Result<()> {
    let source = Arc::new(
        WsSource::new(&profile.url, profile.token.as_deref())
            .context("invalid gateway url")?
            .with_timeout(profile.request_timeout()),
    );
    let dash = Dashboard::new(source.clone(), source, profile.intervals)
        .with_final_roles(profile.final_roles.clone());
    dash.set_rank_windows(parsed.rank_cpu, parsed.rank_ram);

    if parsed.servers.is_empty() && parsed.install.is_none() {
        bail!("nothing to watch; pass --server ADDR (repeatable) or --install ADDR");
    }
    if !parsed.servers.is_empty() {
        dash.watch_fleet(&parsed.servers);
    }
    if let Some(sel) = parsed.select.as_ref().or(parsed.servers.first()) {
        dash.select_server(sel);
    }
    let mut install_rx = parsed.install.as_deref().map(|addr| dash.start_install(addr));

    if parsed.once {
        wait_first_cycle(&dash, profile.request_timeout()).await;
        print_tick(&dash, parsed.window);
        dash.shutdown();
        return Ok(());
    }

    let mut ticker = tokio::time::interval(profile.intervals.live());
    loop {
        tokio::select! {
            _ = ticker.tick() => print_tick(&dash, parsed.window),
            changed = async {
                match install_rx.as_mut() {
                    Some(rx) => rx.changed().await.map(|_| rx.borrow_and_update().clone()),
                    None => std::future::pending().await,
                }
            } => match changed {
                Ok(status) => {
                    print_install(parsed.install.as_deref().unwrap_or_default(), &status);
                    if status.state.is_terminal() {
                        install_rx = None;
                        // install-only runs end with the tracker
                        if parsed.servers.is_empty() {
                            break;
                        }
                    }
                }
                Err(_) => install_rx = None,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    dash.shutdown();
    Ok(())
}

/// Give the first fleet cycle a chance to settle before a one-shot print.
async fn wait_first_cycle(dash: &Dashboard, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        let pending = dash
            .fleet_overview()
            .servers
            .iter()
            .any(|s| s.status == EntityStatus::Pending);
        let live_pending = dash
            .selected()
            .is_some_and(|a| dash.status(&EntityId::server(a)) == EntityStatus::Pending);
        if !pending && !live_pending {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    warn!("first poll cycle did not settle in time");
}

fn print_tick(dash: &Dashboard, window: TimeWindow) {
    print_fleet(&dash.fleet_overview());
    let Some(addr) = dash.selected() else {
        return;
    };
    let id = EntityId::server(&addr);
    let line = match (dash.live_sample(&id), dash.status(&id)) {
        (_, EntityStatus::Unreachable { error, .. }) => format!("{addr}: unreachable ({error})"),
        (Some(s), _) => format!(
            "{addr}: cpu {:5.1}%  mem {:5.1}% ({})  disk {:5.1}%",
            s.cpu_percent,
            s.mem_percent,
            human_kb(s.mem_used_kb as u64),
            s.disk_percent
        ),
        (None, EntityStatus::NoData) => format!("{addr}: no data collected yet"),
        (None, _) => format!("{addr}: waiting"),
    };
    println!("{line}");
    let chart = dash.series(&id, window);
    if !chart.samples.is_empty() {
        let (lo, hi) = dash.series_domain(&id, window, Axis::Cpu);
        println!(
            "  chart {window}: {} samples, cpu axis {lo:.0}..{hi:.0}{}",
            chart.samples.len(),
            chart.coverage.notice().map(|n| format!(" ({n})")).unwrap_or_default()
        );
    }
    let (cpu_w, ram_w) = dash.rank_windows();
    for (metric, window) in [(Metric::CpuPercent, cpu_w), (Metric::RamPercent, ram_w)] {
        let top = dash.top_processes(&id, metric, window, DEFAULT_TOP_N);
        if top.is_empty() {
            continue;
        }
        let list: Vec<String> = top
            .iter()
            .map(|p| format!("{} ({:.1}%)", p.display_command(32), p.value(metric)))
            .collect();
        println!("  top {} [{}]: {}", metric.as_str(), window.label(), list.join(", "));
    }
}

fn print_fleet(o: &FleetOverview) {
    if o.servers.is_empty() {
        return;
    }
    let avg = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{x:.1}%"));
    println!(
        "fleet: {} servers  avg cpu {}  mem {}  disk {}",
        o.servers.len(),
        avg(o.avg_cpu),
        avg(o.avg_mem),
        avg(o.avg_disk)
    );
    for s in &o.servers {
        let state = match &s.status {
            EntityStatus::Pending => "pending".to_string(),
            EntityStatus::NoData => "no data".to_string(),
            EntityStatus::Live { .. } => s
                .latest
                .as_ref()
                .map(|l| format!("cpu {:.1}%", l.cpu_percent))
                .unwrap_or_default(),
            EntityStatus::Unreachable { error, .. } => {
                format!("unreachable: {}", truncate_middle(error, 48))
            }
        };
        println!("  {:<20} {state}", s.server.address());
    }
}

fn print_install(addr: &str, st: &InstallStatus) {
    match &st.state {
        fleetwatch::install::InstallState::Error(e) => {
            println!("install {addr}: error: {e} (restart to retry)")
        }
        s => println!(
            "install {addr}: {}{}",
            s.label(),
            if st.agent_ready() { " (agent ready)" } else { "" }
        ),
    }
}

fn prompt_yes_no(prompt: &str) -> bool {
    eprint!("{prompt}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_ok() {
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    } else {
        false
    }
}

fn prompt_string(prompt: &str) -> io::Result<String> {
    eprint!("{prompt}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line)
}
