use anyhow::{Result, anyhow};
use console::style;
use ddwarden_core::catalog::{Event, Operation, Passphrase};
use ddwarden_core::device::{Device, DeviceKind};
use ddwarden_core::outcome::Outcome;
use ddwarden_core::progress::ProgressSample;
use ddwarden_core::size::DiskSize;
use dialoguer::{Confirm, Input, Password, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Display;
use std::io::{IsTerminal, stdout};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Hides the `^C` the terminal would echo on Ctrl+C for as long as it lives.
///
/// Cancellation is reported by the progress view instead; the previous
/// terminal settings come back on drop.
pub struct EchoGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoGuard {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            Self {
                saved: Self::suppress_echoctl(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    #[cfg(unix)]
    fn suppress_echoctl() -> Option<Termios> {
        if !stdout().is_terminal() {
            return None;
        }
        let fd = stdout().as_raw_fd();
        let saved = Termios::from_fd(fd).ok()?;
        let mut quiet = saved;
        quiet.c_lflag &= !ECHOCTL;
        tcsetattr(fd, TCSANOW, &quiet).ok()?;
        Some(saved)
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref saved) = self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}

/// Which devices a prompt should offer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Targets {
    /// Whole disks only.
    Disks,
    /// Disks and partitions.
    Any,
    Loops,
}

impl Targets {
    fn admits(self, device: &Device) -> bool {
        match self {
            Targets::Disks => device.kind == DeviceKind::Disk,
            Targets::Any => device.kind != DeviceKind::Loop,
            Targets::Loops => device.kind == DeviceKind::Loop,
        }
    }
}

/// Lets the operator pick one of `devices`, filtered by `targets`.
pub fn select_device(devices: &[Device], targets: Targets, prompt: &str) -> Result<Device> {
    let candidates: Vec<&Device> = devices.iter().filter(|d| targets.admits(d)).collect();
    if candidates.is_empty() {
        return Err(anyhow!("No suitable devices found."));
    }

    let items: Vec<String> = candidates.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(candidates[selection].clone())
}

pub fn choose<T: Display + Copy>(prompt: &str, options: &[T], default: usize) -> Result<T> {
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(options)
        .default(default)
        .interact()?;
    Ok(options[selection])
}

pub fn ask_yes_no(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

pub fn ask_text(prompt: &str, default: Option<String>) -> Result<String> {
    let theme = ColorfulTheme::default();
    let mut input = Input::<String>::with_theme(&theme).with_prompt(prompt);
    if let Some(default) = default {
        input = input.default(default);
    }
    Ok(input.interact_text()?)
}

pub fn ask_size(prompt: &str) -> Result<DiskSize> {
    let text = Input::<String>::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .validate_with(|input: &String| DiskSize::parse(input).map(|_| ()).map_err(|e| e.to_string()))
        .interact_text()?;
    Ok(DiskSize::parse(&text)?)
}

pub fn ask_passphrase() -> Result<Passphrase> {
    let secret = Password::with_theme(&ColorfulTheme::default())
        .with_prompt("Encryption passphrase")
        .with_confirmation("Repeat passphrase", "Passphrases do not match.")
        .interact()?;
    Ok(Passphrase::new(secret)?)
}

/// The confirmation gate: shows what is about to happen and asks once.
pub fn confirm_operation(op: &Operation) -> Result<bool> {
    println!();
    if let Some(warning) = op.warning() {
        println!("{} {}", style("WARNING:").red().bold(), warning);
    }
    println!("{}", style(op.label()).bold());
    for (key, value) in op.details() {
        println!("  {:<11} {}", format!("{key}:"), style(value).cyan());
    }
    println!();

    let confirmed = ask_yes_no("Are you sure you want to proceed?", false)?;
    if !confirmed {
        println!("{} cancelled.", op.label());
    }
    Ok(confirmed)
}

fn style_or_default(template: &str, fallback: ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or(fallback)
}

fn bytes_bar(total: u64, prefix: String) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_prefix(prefix);
    bar.set_style(
        style_or_default(
            "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            ProgressStyle::default_bar(),
        )
        .progress_chars("■ "),
    );
    bar
}

fn bytes_spinner(prefix: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_prefix(prefix);
    bar.set_style(style_or_default(
        "{prefix:12} [{elapsed_precise}] [{spinner:.blue}] {bytes} ({bytes_per_sec}) {msg}",
        ProgressStyle::default_spinner(),
    ));
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn stage_spinner(stage: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(style_or_default(
        "[{elapsed_precise}] {spinner:.blue} {msg}",
        ProgressStyle::default_spinner(),
    ));
    bar.set_message(stage.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Renders an operation's [`Event`]s as indicatif bars.
///
/// A new bar starts for each stage and for each wipe pass; while a stage has
/// not reported byte counts it shows as a spinner.
pub struct ProgressView {
    stage: String,
    bar: Option<ProgressBar>,
    /// `(pass, total)` of the sample stream the current bar tracks.
    tracking: Option<(usize, u64)>,
}

impl ProgressView {
    pub fn new() -> Self {
        Self {
            stage: String::new(),
            bar: None,
            tracking: None,
        }
    }

    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::Stage(stage) => {
                self.finish_current();
                self.bar = Some(stage_spinner(&stage));
                self.stage = stage;
            }
            Event::Progress(sample) => self.on_progress(sample),
            Event::LoopDevice(device) => {
                if let Some(bar) = &self.bar {
                    bar.println(format!("Loop device: {}", style(device.display()).cyan()));
                }
            }
        }
    }

    fn on_progress(&mut self, sample: ProgressSample) {
        let key = (sample.pass, sample.total);
        if self.tracking != Some(key) {
            match self.bar.take() {
                Some(bar) if self.tracking.is_some() => bar.finish(),
                Some(bar) => bar.finish_and_clear(),
                None => {}
            }
            let prefix = if sample.pass_count > 1 {
                format!("Pass {}/{}", sample.pass + 1, sample.pass_count)
            } else {
                self.stage.clone()
            };
            self.bar = Some(if sample.total > 0 {
                bytes_bar(sample.total, prefix)
            } else {
                bytes_spinner(prefix)
            });
            self.tracking = Some(key);
        }

        if let Some(bar) = &self.bar {
            bar.set_position(sample.bytes);
            if sample.pass_count > 1 {
                if let Some(pct) = sample.overall_percentage() {
                    bar.set_message(format!("{pct:.0}% overall"));
                }
            }
        }
    }

    fn finish_current(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
        self.tracking = None;
    }

    /// Leaves the last bar on screen with a verdict.
    pub fn finish(mut self, outcome: &Outcome) {
        let Some(bar) = self.bar.take() else {
            return;
        };
        match outcome {
            Outcome::Succeeded => bar.finish_with_message("Done."),
            Outcome::Cancelled => bar.abandon_with_message("Cancelled."),
            Outcome::Failed { .. } => bar.abandon_with_message("❌ Failed."),
        }
    }
}

pub fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No devices found.");
        return;
    }

    println!(
        "\n  {:<17} {:>11}  {:<24} {}",
        "DEVICE", "SIZE", "MODEL", "LOCATION"
    );
    println!("  {:-<17} {:->11}  {:-<24} {:-<20}", "", "", "", "");
    for device in devices {
        println!("  {device}");
    }
    println!();
}
