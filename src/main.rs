use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand};
use keyring::Entry;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};

// ---------- Constants ----------
const SERVICE_NAME: &str = "sharepoint-graph-cli"; // OS keyring service name
const CONFIG_ACCOUNT: &str = "config"; // key for config JSON
const RT_ACCOUNT: &str = "refresh_token"; // key for refresh token

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AppConfig {
    tenant: String,    // e.g. "common", "organizations", "consumers", or your tenant GUID
    client_id: String, // your app registration's Application (client) ID
    scopes: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tenant: "common".to_string(),
            client_id: String::new(),
            scopes: vec![
                "openid".to_string(),
                "offline_access".to_string(),
                "Sites.Manage.All".to_string(),
            ],
        }
    }
}

// ---------- CLI ----------

#[derive(Parser)]
#[command(
    version,
    about = "Tiny Sharepoint/Graph CLI (Rust)",
    long_about = "mdspcli is a small CLI for Microsoft Graph Sharepoint sites, lists and drive items.\n\nAuthentication:\n- Uses device code flow with a public client app registration\n- Stores config and refresh token in your OS keyring\n  - Service: sharepoint-graph-cli\n  - Accounts: config (JSON), refresh_token\n\nQuick start:\n- Run `init` to enter tenant, client_id, and scopes, then sign in\n- Use `sites` to find a site ID, then `lists --site <id>`,\n  `files --site <id> --folder <path>`, `folders --site <id> --folder <path>`\n- Use `run` to call the API itself, e.g.\n  `run --resource lists --site <id> --list <id> --path /items`\n\nAll results print as JSON. A file download (`run --resource files --path /content`)\nattaches the bytes base64-encoded under binary.data of the printed record."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize auth (and store config); prompts if missing/invalid
    Init,

    /// List Sharepoint sites as name/value options
    Sites {
        /// Full-text site search (empty returns followed and recent sites)
        #[arg(long, default_value = "")]
        search: String,
    },

    /// List the visible lists of a site
    Lists {
        /// Site ID (see `sites`)
        #[arg(long)]
        site: String,
    },

    /// List files under a drive folder path
    Files {
        /// Site ID (see `sites`)
        #[arg(long)]
        site: String,
        /// Folder path, e.g. "Shared Documents/reports" (empty for the drive root)
        #[arg(long, default_value = "")]
        folder: String,
    },

    /// List folders under a drive folder path (the path's own folder included)
    Folders {
        /// Site ID (see `sites`)
        #[arg(long)]
        site: String,
        /// Folder path (empty for the drive root)
        #[arg(long, default_value = "")]
        folder: String,
    },

    /// Run one resource operation and print its execution records
    Run {
        /// Resource kind: lists | files | folders
        #[arg(long)]
        resource: String,
        /// Site ID (see `sites`)
        #[arg(long)]
        site: Option<String>,
        /// List ID (resource = lists)
        #[arg(long)]
        list: Option<String>,
        /// Drive item ID of the file (resource = files)
        #[arg(long)]
        file_id: Option<String>,
        /// Drive item ID of the folder (resource = folders)
        #[arg(long)]
        folder_id: Option<String>,
        /// HTTP method to send
        #[arg(long, default_value = "GET")]
        method: String,
        /// Trailing URL path, e.g. /items, /children or /content
        #[arg(long, default_value = "")]
        path: String,
        /// JSON body to send (not for GET/DELETE)
        #[arg(long)]
        body: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            ensure_login(true).await?;
            println!("✅ Initialized and signed in.");
        }
        Commands::Sites { search } => {
            let graph = Graph::new(ensure_login(false).await?);
            print_json(&site_options(&graph, &search).await?)?;
        }
        Commands::Lists { site } => {
            let graph = Graph::new(ensure_login(false).await?);
            let mut params = Params::new();
            params.set("site", site);
            print_json(&list_options(&graph, &params).await?)?;
        }
        Commands::Files { site, folder } => {
            let graph = Graph::new(ensure_login(false).await?);
            let mut params = Params::new();
            params.set("site", site);
            params.set("folder", folder);
            print_json(&file_options(&graph, &params).await?)?;
        }
        Commands::Folders { site, folder } => {
            let graph = Graph::new(ensure_login(false).await?);
            let mut params = Params::new();
            params.set("site", site);
            params.set("folder", folder);
            print_json(&folder_options(&graph, &params).await?)?;
        }
        Commands::Run {
            resource,
            site,
            list,
            file_id,
            folder_id,
            method,
            path,
            body,
        } => {
            let graph = Graph::new(ensure_login(false).await?);
            let mut params = Params::new();
            params.set("resource", resource);
            params.set("method", method);
            params.set("path", path);
            if let Some(site) = site {
                params.set("site", site);
            }
            if let Some(list) = list {
                params.set("list", list);
            }
            if let Some(file_id) = file_id {
                params.set("fileId", file_id);
            }
            if let Some(folder_id) = folder_id {
                params.set("folderId", folder_id);
            }
            if let Some(body) = body {
                let body: Value =
                    serde_json::from_str(&body).context("--body is not valid JSON")?;
                params.set("body", body);
            }
            let records = run_operation(&graph, &params).await?;
            print_json(&records)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------- Auth & Storage ----------

async fn ensure_login(force_interactive: bool) -> Result<String> {
    // 1) Load config
    let mut cfg = load_config()?;

    // 2) Try refresh token if present and not forcing interactive
    if !force_interactive {
        if let Ok(rt) = stored_refresh_token() {
            if let Ok(at) = refresh_access_token(&cfg, &rt).await {
                return Ok(at);
            }
        }
    }

    // 3) If config missing values or refresh failed, prompt and do device code
    if cfg.client_id.trim().is_empty() || cfg.tenant.trim().is_empty() {
        cfg = prompt_for_config(cfg)?;
        save_config(&cfg)?;
    }

    let (access_token, refresh_token) = device_code_login(&cfg).await?;
    store_refresh_token(&refresh_token)?;

    // 4) Validate by fetching the tenant's root site
    let graph = Graph::new(access_token.clone());
    let root = graph.execute(&ApiRequest::new("GET", "/sites/root")).await?;
    let name = root
        .get("displayName")
        .and_then(|v| v.as_str())
        .unwrap_or("<unknown>");
    println!("Signed in. Root site: {}", name);

    Ok(access_token)
}

fn load_config() -> Result<AppConfig> {
    let entry = Entry::new(SERVICE_NAME, CONFIG_ACCOUNT)?;
    match entry.get_password() {
        Ok(json) => {
            let cfg: AppConfig = serde_json::from_str(&json).context("parse config JSON")?;
            Ok(cfg)
        }
        Err(_) => Ok(AppConfig::default()),
    }
}

fn save_config(cfg: &AppConfig) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, CONFIG_ACCOUNT)?;
    entry.set_password(&serde_json::to_string(cfg)?)?;
    Ok(())
}

fn stored_refresh_token() -> Result<String> {
    let entry = Entry::new(SERVICE_NAME, RT_ACCOUNT)?;
    Ok(entry.get_password()?)
}

fn store_refresh_token(rt: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, RT_ACCOUNT)?;
    entry.set_password(rt)?;
    Ok(())
}

fn prompt_line(label: &str) -> String {
    print!("{}> ", label);
    io::stdout().flush().ok();
    let mut s = String::new();
    io::stdin().read_line(&mut s).ok();
    s.trim().to_string()
}

fn prompt_for_config(mut cfg: AppConfig) -> Result<AppConfig> {
    println!("Let's configure Microsoft Graph auth. Press Enter to accept the suggested default.");

    println!(
        "Tenant (examples: common | organizations | consumers | your-tenant-guid). Default: {}",
        cfg.tenant
    );
    let tenant = prompt_line("tenant");
    if !tenant.is_empty() {
        cfg.tenant = tenant;
    }

    println!("Application (client) ID from Entra app registration (e.g. 11111111-2222-3333-4444-555555555555)");
    let client_id = prompt_line("client_id");
    if client_id.is_empty() && cfg.client_id.trim().is_empty() {
        return Err(anyhow!("client_id is required"));
    }
    if !client_id.is_empty() {
        cfg.client_id = client_id;
    }

    println!("Scopes (space-separated). Typical: openid offline_access Sites.Manage.All");
    println!("Default: {}", cfg.scopes.join(" "));
    let scopes = prompt_line("scopes");
    if !scopes.is_empty() {
        cfg.scopes = scopes.split_whitespace().map(str::to_string).collect();
    }

    Ok(cfg)
}

async fn device_code_login(cfg: &AppConfig) -> Result<(String, String)> {
    #[derive(Deserialize)]
    struct DeviceAuthorization {
        device_code: String,
        user_code: String,
        verification_uri: String,
        expires_in: i64,
        interval: Option<i64>,
        message: Option<String>,
    }

    #[derive(Deserialize)]
    struct Tokens {
        access_token: String,
        refresh_token: Option<String>,
    }

    #[derive(Deserialize)]
    struct TokenError {
        error: String,
        error_description: Option<String>,
    }

    let client = reqwest::Client::new();
    let scope = cfg.scopes.join(" ");

    let auth: DeviceAuthorization = client
        .post(format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/devicecode",
            cfg.tenant
        ))
        .form(&[
            ("client_id", cfg.client_id.as_str()),
            ("scope", scope.as_str()),
        ])
        .send()
        .await
        .context("device code request failed")?
        .error_for_status()
        .context("device code HTTP error")?
        .json()
        .await
        .context("parse device code JSON")?;

    println!("\n== Device sign-in ==");
    match &auth.message {
        Some(msg) => println!("{}", msg),
        None => println!(
            "Open {} and enter code {}",
            auth.verification_uri, auth.user_code
        ),
    }

    let token_url = format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
        cfg.tenant
    );
    let mut interval = auth.interval.unwrap_or(5).max(1) as u64;
    let deadline = std::time::Instant::now()
        + std::time::Duration::from_secs((auth.expires_in as u64).saturating_sub(5));

    loop {
        if std::time::Instant::now() > deadline {
            return Err(anyhow!("device code expired; run `init` again"));
        }

        let res = client
            .post(&token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("client_id", cfg.client_id.as_str()),
                ("device_code", auth.device_code.as_str()),
            ])
            .send()
            .await
            .context("token poll failed")?;

        if res.status().is_success() {
            let tokens: Tokens = res.json().await.context("parse token JSON")?;
            let rt = tokens
                .refresh_token
                .ok_or_else(|| anyhow!("no refresh_token in response"))?;
            return Ok((tokens.access_token, rt));
        }

        let err: TokenError = res.json().await.unwrap_or_else(|_| TokenError {
            error: "unknown_error".into(),
            error_description: None,
        });
        match err.error.as_str() {
            "authorization_pending" => {}
            "slow_down" => interval += 2,
            other => {
                return Err(anyhow!(
                    "device code error: {} ({:?})",
                    other,
                    err.error_description
                ));
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
    }
}

async fn refresh_access_token(cfg: &AppConfig, refresh_token: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Tokens {
        access_token: String,
        refresh_token: Option<String>,
    }

    let scope = cfg.scopes.join(" ");
    let res = reqwest::Client::new()
        .post(format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            cfg.tenant
        ))
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", cfg.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ])
        .send()
        .await
        .context("refresh token request failed")?;

    if !res.status().is_success() {
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        return Err(anyhow!("refresh failed: {}: {}", status, text));
    }

    let tokens: Tokens = res.json().await.context("parse refresh token JSON")?;
    if let Some(rt) = &tokens.refresh_token {
        // Microsoft may rotate refresh tokens; always store the latest
        store_refresh_token(rt)?;
    }

    Ok(tokens.access_token)
}

// ---------- Errors ----------

#[derive(Debug)]
enum ApiError {
    /// The request could not be constructed (unusable method).
    Request(String),
    Transport(reqwest::Error),
    Status { status: StatusCode, body: String },
    Decode(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Request(msg) => write!(f, "invalid request: {msg}"),
            ApiError::Transport(e) => write!(f, "request failed: {e}"),
            ApiError::Status { status, body } => write!(f, "Graph error {status}: {body}"),
            ApiError::Decode(msg) => write!(f, "unexpected response shape: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum OpError {
    MissingParameter(String),
    Api(ApiError),
    UnsupportedResource(String),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::MissingParameter(name) => write!(f, "parameter not set: {name}"),
            OpError::Api(e) => write!(f, "{e}"),
            OpError::UnsupportedResource(kind) => write!(f, "unsupported resource kind: {kind}"),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpError::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApiError> for OpError {
    fn from(e: ApiError) -> Self {
        OpError::Api(e)
    }
}

// ---------- Graph client ----------

/// One Graph API request as plain data: method, path, and the knobs a caller
/// may override before execution.
#[derive(Debug, Clone)]
struct ApiRequest {
    method: String,
    resource: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    headers: Vec<(String, String)>,
    uri: Option<String>,
    json: bool, // JSON negotiation; disabled for binary fetches
}

impl ApiRequest {
    fn new(method: &str, resource: &str) -> Self {
        Self {
            method: method.to_string(),
            resource: resource.to_string(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            uri: None,
            json: true,
        }
    }

    fn query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    #[allow(dead_code)]
    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[allow(dead_code)]
    fn uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    fn binary(mut self) -> Self {
        self.json = false;
        self
    }

    fn url(&self, base: &str) -> String {
        match &self.uri {
            Some(uri) => uri.clone(),
            None => format!("{base}{}", self.resource),
        }
    }

    fn has_content_type(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
    }
}

/// An authenticated Graph session; passed explicitly to every operation.
struct Graph {
    http: reqwest::Client,
    token: String,
    base: String,
}

impl Graph {
    fn new(token: String) -> Self {
        Self::with_base(token, GRAPH_BASE)
    }

    fn with_base(token: String, base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base: base.to_string(),
        }
    }

    async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ApiError::Request(format!("unusable HTTP method: {}", request.method)))?;

        let mut builder = self
            .http
            .request(method, request.url(&self.base))
            .bearer_auth(&self.token);
        if request.json && !request.has_content_type() {
            builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status { status, body })
        }
    }

    async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self.execute_as(request).await
    }

    async fn execute_as<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(ApiError::Transport)
    }

    async fn execute_binary(&self, request: &ApiRequest) -> Result<Vec<u8>, ApiError> {
        Ok(self
            .send(request)
            .await?
            .bytes()
            .await
            .map_err(ApiError::Transport)?
            .to_vec())
    }
}

// ---------- Parameters ----------

/// Source of operation parameters. Lookups return an error for unknown names
/// so a misbehaving source and an unset value can be folded together.
trait ParamSource {
    fn raw(&self, name: &str, index: usize) -> Result<Value>;
}

#[derive(Debug, Default, Clone)]
struct Params(serde_json::Map<String, Value>);

impl Params {
    fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }
}

impl ParamSource for Params {
    fn raw(&self, name: &str, _index: usize) -> Result<Value> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such parameter: {name}"))
    }
}

// Presence check: null, false, "" and 0 all count as "not configured".
fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

fn optional_param(source: &dyn ParamSource, name: &str, index: usize) -> Option<Value> {
    source.raw(name, index).ok().filter(is_set)
}

fn require_param(source: &dyn ParamSource, name: &str, index: usize) -> Result<Value, OpError> {
    optional_param(source, name, index).ok_or_else(|| OpError::MissingParameter(name.to_string()))
}

fn optional_str(source: &dyn ParamSource, name: &str, index: usize) -> Option<String> {
    optional_param(source, name, index).map(value_to_string)
}

fn require_str(source: &dyn ParamSource, name: &str, index: usize) -> Result<String, OpError> {
    require_param(source, name, index).map(value_to_string)
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

// ---------- Execution records ----------

/// One unit of operation output: a JSON projection of the remote entity plus
/// an optional binary attachment map keyed by name ("data" by convention).
#[derive(Debug, Serialize, PartialEq)]
struct Record {
    json: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    binary: Option<BTreeMap<String, BinaryAttachment>>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct BinaryAttachment {
    file_name: String,
    mime_type: String,
    #[serde(serialize_with = "base64_bytes")]
    data: Vec<u8>,
}

fn base64_bytes<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(data))
}

fn prepare_binary_data(data: Vec<u8>, file_name: &str, mime_type: &str) -> BinaryAttachment {
    BinaryAttachment {
        file_name: file_name.to_string(),
        mime_type: mime_type.to_string(),
        data,
    }
}

fn wrap_json(mut json: Value) -> Vec<Record> {
    // Collection responses arrive wrapped in { "value": ... }.
    if let Some(value) = json
        .get_mut("value")
        .map(Value::take)
        .filter(|value| !value.is_null())
    {
        json = value;
    }
    match json {
        Value::Array(items) => items
            .into_iter()
            .map(|json| Record { json, binary: None })
            .collect(),
        other => vec![Record {
            json: other,
            binary: None,
        }],
    }
}

fn wrap_binary(json: Value, attachment: BinaryAttachment) -> Record {
    Record {
        json,
        binary: Some(BTreeMap::from([("data".to_string(), attachment)])),
    }
}

// ---------- Sharepoint entities ----------

#[derive(Debug, Deserialize)]
struct Envelope<A> {
    value: A,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct SharepointSite {
    id: String,
    display_name: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct SharepointList {
    id: String,
    display_name: String,
    name: String,
    list: ListFacet,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ListFacet {
    hidden: bool,
    template: String,
}

/// A drive item; files carry a `file` facet, folders a `folder` facet.
#[derive(Debug, Deserialize)]
struct SharepointItem {
    id: String,
    name: String,
    #[serde(default)]
    file: Option<FileFacet>,
    #[serde(default)]
    folder: Option<FolderFacet>,
}

impl SharepointItem {
    fn is_file(&self) -> bool {
        self.file.is_some()
    }

    fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct FolderFacet {
    #[serde(default)]
    child_count: i64,
}

/// A name/value pair for populating choice menus.
#[derive(Debug, Serialize, PartialEq)]
struct PropertyOption {
    name: String,
    value: String,
}

// ---------- Resource operations ----------

async fn run_operation(graph: &Graph, params: &dyn ParamSource) -> Result<Vec<Record>, OpError> {
    let resource = require_str(params, "resource", 0)?;
    match resource.as_str() {
        "lists" => {
            let site = require_str(params, "site", 0)?;
            let list = require_str(params, "list", 0)?;
            let path = url_path(params);
            let response =
                call(graph, params, &format!("/sites/{site}/lists/{list}{path}")).await?;
            Ok(wrap_json(response))
        }
        "files" => {
            let site = require_str(params, "site", 0)?;
            let file_id = require_str(params, "fileId", 0)?;
            let path = url_path(params);
            if path.starts_with("/content") {
                // Metadata first: the binary fetch needs the file's name and MIME type.
                let details =
                    call(graph, params, &format!("/sites/{site}/drive/items/{file_id}")).await?;
                let item: SharepointItem = serde_json::from_value(details.clone())
                    .map_err(|e| ApiError::Decode(e.to_string()))?;
                let file = item.file.ok_or_else(|| {
                    ApiError::Decode(format!("item {} has no file facet", item.id))
                })?;
                let data = graph
                    .execute_binary(
                        &ApiRequest::new(
                            "GET",
                            &format!("/sites/{site}/drive/items/{file_id}/content"),
                        )
                        .binary(),
                    )
                    .await?;
                let attachment = prepare_binary_data(data, &item.name, &file.mime_type);
                Ok(vec![wrap_binary(details, attachment)])
            } else {
                let response = call(
                    graph,
                    params,
                    &format!("/sites/{site}/drive/items/{file_id}{path}"),
                )
                .await?;
                Ok(wrap_json(response))
            }
        }
        "folders" => {
            let site = require_str(params, "site", 0)?;
            let folder_id = require_str(params, "folderId", 0)?;
            let path = url_path(params);
            let response = call(
                graph,
                params,
                &format!("/sites/{site}/drive/items/{folder_id}{path}"),
            )
            .await?;
            Ok(wrap_json(response))
        }
        other => Err(OpError::UnsupportedResource(other.to_string())),
    }
}

async fn call(graph: &Graph, params: &dyn ParamSource, resource: &str) -> Result<Value, OpError> {
    let method = require_str(params, "method", 0)?;
    let body = optional_param(params, "body", 0);
    Ok(graph
        .execute(&ApiRequest::new(&method, resource).body(body))
        .await?)
}

fn url_path(params: &dyn ParamSource) -> String {
    optional_str(params, "path", 0).unwrap_or_default()
}

// ---------- Option helpers ----------

async fn site_options(graph: &Graph, search: &str) -> Result<Vec<PropertyOption>, OpError> {
    let sites: Envelope<Vec<SharepointSite>> = graph
        .execute_as(&ApiRequest::new("GET", "/sites").query("search", search))
        .await?;
    Ok(sites
        .value
        .into_iter()
        .map(|site| PropertyOption {
            value: site_ref(&site.id),
            name: site.display_name,
        })
        .collect())
}

// Site ids are composite "host,collection,web" strings; downstream calls
// address the site by the collection segment.
fn site_ref(id: &str) -> String {
    id.split(',').nth(1).unwrap_or(id).to_string()
}

async fn list_options(
    graph: &Graph,
    params: &dyn ParamSource,
) -> Result<Vec<PropertyOption>, OpError> {
    let site = require_str(params, "site", 0)?;
    let lists: Envelope<Vec<SharepointList>> = graph
        .execute_as(&ApiRequest::new("GET", &format!("/sites/{site}/lists")))
        .await?;
    Ok(lists
        .value
        .into_iter()
        .filter(|list| !list.list.hidden)
        .map(|list| PropertyOption {
            name: list.display_name,
            value: list.id,
        })
        .collect())
}

// Folder paths may arrive with a leading slash; drive addressing wants them bare.
fn folder_path(params: &dyn ParamSource) -> String {
    optional_str(params, "folder", 0)
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string()
}

async fn get_item(graph: &Graph, params: &dyn ParamSource) -> Result<SharepointItem, OpError> {
    let site = require_str(params, "site", 0)?;
    let path = folder_path(params);
    let resource = if path.is_empty() {
        format!("/sites/{site}/drive/root")
    } else {
        format!("/sites/{site}/drive/root:/{path}")
    };
    Ok(graph.execute_as(&ApiRequest::new("GET", &resource)).await?)
}

async fn get_items(
    graph: &Graph,
    params: &dyn ParamSource,
) -> Result<Vec<SharepointItem>, OpError> {
    let site = require_str(params, "site", 0)?;
    let path = folder_path(params);
    let resource = if path.is_empty() {
        format!("/sites/{site}/drive/root/children")
    } else {
        format!("/sites/{site}/drive/root:/{path}:/children")
    };
    let children: Envelope<Vec<SharepointItem>> =
        graph.execute_as(&ApiRequest::new("GET", &resource)).await?;
    Ok(children.value)
}

async fn file_options(
    graph: &Graph,
    params: &dyn ParamSource,
) -> Result<Vec<PropertyOption>, OpError> {
    let items = get_items(graph, params).await?;
    Ok(items
        .into_iter()
        .filter(SharepointItem::is_file)
        .map(item_option)
        .collect())
}

async fn folder_options(
    graph: &Graph,
    params: &dyn ParamSource,
) -> Result<Vec<PropertyOption>, OpError> {
    // The selected path itself is a valid target, so offer it alongside its children.
    let current = get_item(graph, params).await?;
    let children = get_items(graph, params).await?;
    Ok(std::iter::once(current)
        .chain(children)
        .filter(SharepointItem::is_folder)
        .map(item_option)
        .collect())
}

fn item_option(item: SharepointItem) -> PropertyOption {
    PropertyOption {
        name: item.name,
        value: item.id,
    }
}

// ---------- Tests ----------
