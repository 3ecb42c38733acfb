use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::app::App;
use crate::OutputFormat;

pub async fn register(
    app: &App,
    email: &str,
    password: Option<String>,
    format: &OutputFormat,
) -> Result<()> {
    let token = credentials_call(app, "/auth/register", email, password).await?;
    app.save_token(&token)?;
    report(email, "Registered and logged in as", format)
}

pub async fn login(
    app: &App,
    email: &str,
    password: Option<String>,
    format: &OutputFormat,
) -> Result<()> {
    let token = credentials_call(app, "/auth/login", email, password).await?;
    app.save_token(&token)?;
    report(email, "Logged in as", format)
}

pub async fn logout(app: &App, format: &OutputFormat) -> Result<()> {
    if let Some(token) = app.stored_token() {
        // Best-effort server-side revocation; local credentials go either way.
        let url = format!("{}/auth/logout", app.server);
        let _ = app.http()?.post(url).bearer_auth(&token).send().await;
    }
    app.clear_credentials()?;
    match format {
        OutputFormat::Json => println!("{}", json!({ "ok": true })),
        OutputFormat::Plain => println!("Logged out (profile '{}')", app.profile),
    }
    Ok(())
}

async fn credentials_call(
    app: &App,
    path: &str,
    email: &str,
    password: Option<String>,
) -> Result<String> {
    let password = resolve_password(password)?;
    let resp = app
        .http()?
        .post(format!("{}{}", app.server, path))
        .json(&json!({ "email": email, "password": password }))
        .send()
        .await
        .with_context(|| format!("Could not reach server at {}", app.server))?;

    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or_else(|_| json!({}));
    if !status.is_success() {
        let code = body["error"].as_str().unwrap_or("UNKNOWN");
        bail!("Server refused ({}): {}", status.as_u16(), code);
    }
    body["token"]
        .as_str()
        .map(|s| s.to_string())
        .context("Server response missing token")
}

/// Use the flag value when given, otherwise read one line from stdin
/// (piped or typed).
fn resolve_password(password: Option<String>) -> Result<String> {
    if let Some(p) = password {
        return Ok(p);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_line(&mut buf)
        .context("Failed to read password from stdin")?;
    let trimmed = buf.trim_end_matches(['\r', '\n']).to_string();
    if trimmed.is_empty() {
        bail!("Password required (pass --password or pipe it on stdin)");
    }
    Ok(trimmed)
}

fn report(email: &str, verb: &str, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", json!({ "ok": true, "email": email })),
        OutputFormat::Plain => println!("{} {}", verb, email),
    }
    Ok(())
}
