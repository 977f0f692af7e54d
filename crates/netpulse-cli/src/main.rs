//! netpulse - terminal driver for the dashboard session.
//!
//! Logs in, registers, requests password resets and logs out against the
//! configured backend, and shows what the route guards would decide for the
//! current session.

use std::io::{self, Write};

use anyhow::Result;
use netpulse_core::form::{FormAction, FormFlow, SubmitOutcome, Success};
use netpulse_core::guard::{GuardDecision, MountedGuard, Route, RouteGuard};
use netpulse_core::{AuthContext, Config};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: netpulse <command>

Commands:
  status                     Show the current session
  login [email]              Sign in
  register <email> [name]    Create an account and sign in
  forgot-password <email>    Request a password reset link
  logout                     Sign out
  guard <route>              Show the guard decision for a route";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn load_config() -> Config {
    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };
    if let Ok(url) = std::env::var("NETPULSE_API_URL") {
        config.api_base_url = url;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let ctx = AuthContext::from_config(load_config())?;
    info!(command, "netpulse starting");

    match command {
        "status" => status(&ctx).await,
        "login" => login(&ctx, args.get(1).cloned()).await,
        "register" => match args.get(1) {
            Some(email) => register(&ctx, email, args.get(2).map(String::as_str)).await,
            None => usage_error("register needs an email"),
        },
        "forgot-password" => match args.get(1) {
            Some(email) => forgot_password(&ctx, email).await,
            None => usage_error("forgot-password needs an email"),
        },
        "logout" => {
            ctx.logout().await;
            println!("Signed out.");
            Ok(())
        }
        "guard" => match args.get(1) {
            Some(route) => {
                guard(&ctx, route);
                Ok(())
            }
            None => usage_error("guard needs a route"),
        },
        other => usage_error(&format!("unknown command '{}'", other)),
    }
}

fn usage_error(message: &str) -> Result<()> {
    eprintln!("Error: {}\n\n{}", message, USAGE);
    std::process::exit(2);
}

async fn status(ctx: &AuthContext) -> Result<()> {
    if ctx.session().current_session().identity_pending() {
        if let Err(e) = ctx.refresh_identity().await {
            eprintln!("Could not verify session: {}", e.user_message());
        }
    }
    let summary = ctx.session().current_session().summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn login(ctx: &AuthContext, email: Option<String>) -> Result<()> {
    let current = ctx.session().current_session();
    if current.is_authenticated() {
        let who = current.user().map(|u| u.display_name().to_string());
        println!(
            "Already signed in{}. Run `netpulse logout` first to switch accounts.",
            who.map(|w| format!(" as {}", w)).unwrap_or_default()
        );
        return Ok(());
    }

    let email = email
        .or_else(|| std::env::var("NETPULSE_EMAIL").ok())
        .or_else(|| ctx.config().last_email.clone())
        .map(Ok)
        .unwrap_or_else(|| prompt("Email: "))?;
    let password = match std::env::var("NETPULSE_PASSWORD") {
        Ok(p) => p,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    // The login page is guest-only; watch it redirect once signed in
    let _page = MountedGuard::mount(ctx.session(), ctx.guest_only(), |to: &Route| {
        println!("Redirecting to {}", to);
    });

    let form = ctx.login_form();
    form.set_value("email", email.clone());
    form.set_value("password", password);
    println!("Signing in...");

    if report(&form, form.submit().await) {
        let mut config = ctx.config().clone();
        config.last_email = Some(email);
        if let Err(e) = config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }
    Ok(())
}

async fn register(ctx: &AuthContext, email: &str, name: Option<&str>) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;

    let form = ctx.register_form();
    form.set_value("email", email);
    form.set_value("password", password);
    form.set_value("confirm_password", confirm);
    if let Some(name) = name {
        form.set_value("name", name);
    }
    println!("Creating account...");
    report(&form, form.submit().await);
    Ok(())
}

async fn forgot_password(ctx: &AuthContext, email: &str) -> Result<()> {
    let form = ctx.password_reset_form();
    form.set_value("email", email);
    report(&form, form.submit().await);
    Ok(())
}

fn guard(ctx: &AuthContext, route: &str) {
    let config = ctx.config();
    let guest_routes = [config.login_route.as_str(), "/register", "/forgot-password"];
    let session = ctx.session().current_session();

    let decision = if guest_routes.contains(&route) {
        ctx.guest_only().decide(&session)
    } else {
        ctx.authenticated_only().decide(&session)
    };

    match decision {
        GuardDecision::Render => println!("{}: render", route),
        GuardDecision::Pending => println!("{}: pending", route),
        GuardDecision::Redirect(to) => println!("{}: redirect to {}", route, to),
    }
}

/// Print the outcome the way the form would show it. Returns true on success.
fn report<A: FormAction>(form: &FormFlow<A>, outcome: SubmitOutcome) -> bool {
    let state = form.state();
    for (field, message) in state.field_errors.iter() {
        eprintln!("  {}: {}", field, message);
    }

    match outcome {
        SubmitOutcome::Succeeded(Success::Authenticated(session)) => {
            let who = session.user().map(|u| u.display_name().to_string());
            println!("Signed in as {}.", who.unwrap_or_else(|| "unknown user".to_string()));
            true
        }
        SubmitOutcome::Succeeded(Success::ResetRequested(_)) => {
            if let Some(notice) = state.notice {
                println!("{}", notice);
            }
            true
        }
        SubmitOutcome::Invalid(_) => false,
        SubmitOutcome::Busy
        | SubmitOutcome::AlreadySignedIn
        | SubmitOutcome::Failed(_)
        | SubmitOutcome::Cancelled => {
            if let Some(message) = state.submit_error {
                eprintln!("Error: {}", message);
            }
            false
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
