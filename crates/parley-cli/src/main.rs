//! `parley` – the dialogue engine's console entry point.
//!
//! This binary is the engine's ignition switch. It:
//!
//! 1. Checks for `~/.parley/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Probes the configured chat provider and reports available models.
//! 3. Drops the operator into an **interactive console** where typed lines run
//!    through the full turn pipeline against the persistent memory graph.
//! 4. Intercepts **Ctrl-C** to drain the enrichment queue and exit cleanly.

mod config;
mod console;
mod probe;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

fn main() {
    // Structured logging plus the optional OTLP pipeline; the guard flushes
    // buffered spans on drop. The console's user-facing output still uses
    // println! for UX consistency.
    let _telemetry = parley_runtime::telemetry::init_tracing("parley-cli");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – finishing the turn and draining memory workers …"
                .yellow()
                .bold()
        );
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(_)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
        }
    }

    let cfg = config::load().ok().flatten().unwrap_or_default();

    // ── Provider discovery ────────────────────────────────────────────────
    print!("\n  Probing provider at {} … ", cfg.provider_url.dimmed());
    match probe::fetch_models(&cfg.provider_url, &cfg.api_key) {
        Ok(models) => {
            println!("{} ({} model(s) available)", "online".green(), models.len());
            if !models.iter().any(|m| m == &cfg.active_model) {
                println!(
                    "  {}  `{}` is not among them; completions may fail.",
                    "Configured model not served.".yellow(),
                    cfg.active_model.bold()
                );
            }
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}  Start one (e.g. `{}`) or fix `provider_url`.",
                "No chat provider detected.".dimmed(),
                "ollama serve".bold()
            );
        }
    }

    let operator = prompt_line("\n  Who is at the console? [operator]: ", "operator");
    println!(
        "  Memory graph: {}\n",
        cfg.resolved_db_path().display().to_string().bold()
    );
    println!(
        "  Type {} or press Ctrl-C to leave.\n",
        "exit".bold().cyan()
    );

    // ── Console ───────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            return;
        }
    };
    if let Err(e) = runtime.block_on(console::run(cfg, operator, shutdown)) {
        println!("{}: {}", "Console error".red(), e);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Parley First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Parley.\n");

    let mut cfg = config::Config::default();

    cfg.provider_url = prompt_line(
        &format!("  Chat provider URL [{}]: ", cfg.provider_url),
        &cfg.provider_url,
    );
    cfg.active_model = prompt_line(
        &format!("  Model name [{}]: ", cfg.active_model),
        &cfg.active_model,
    );
    cfg.api_key = prompt_line("  API key (empty for local providers) []: ", "");

    let fallback = prompt_line("  Fallback provider URL (empty to disable) []: ", "");
    if !fallback.is_empty() {
        cfg.fallback_url = fallback;
        cfg.fallback_model = prompt_line(
            &format!("  Fallback model [{}]: ", cfg.active_model),
            &cfg.active_model,
        );
        cfg.fallback_api_key = prompt_line("  Fallback API key []: ", "");
    }

    cfg.embeddings_model = prompt_line(
        "  Embeddings model (empty for recency-only memory) []: ",
        "",
    );

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___               __         "#.bold().cyan());
    println!("{}", r#"  / _ \___ _____/ /__ __ __"#.bold().cyan());
    println!("{}", r#" / ___/ _ `/ __/ / -_) // /"#.bold().cyan());
    println!("{}", r#"/_/   \_,_/_/ /_/\__/\_, / "#.bold().cyan());
    println!("{}", r#"                    /___/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Parley".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Per-Person Dialogue Engine");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
