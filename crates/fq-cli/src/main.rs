//! # fq — command-line client for fq-hub
//!
//! - `fq query <json|@file>`: run a query, print it as a table.
//! - `fq columns <table>`: list a table's columns.
//! - `fq refresh <table>`: wait for fresh column statistics.
//! - `fq update <table> <json>`: apply a `set`/`where` update.
//!
//! The hub is found at `FQ_BASE_URL` (default `http://127.0.0.1:5000`).

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tabled::builder::Builder;
use tabled::settings::Style;

#[derive(Parser)]
#[command(name = "fq", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query given as JSON text, or `@path` to read it from a file.
    Query {
        query: String,

        /// Template parameter `name=value` (repeatable).
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,

        /// Print the raw JSON response instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List the columns of a table.
    Columns { table: String },

    /// Mark a table's statistics dirty and wait for them.
    Refresh { table: String },

    /// Update documents: `{"set": {...}, "where": {...}}`.
    Update { table: String, command: String },
}

fn main() {
    let cli = Cli::parse();
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(async_main(cli.command)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn async_main(cmd: Commands) -> Result<(), String> {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("FQ_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".to_string());

    match cmd {
        Commands::Query {
            query,
            params,
            json,
        } => {
            let text = read_query(&query)?;
            let params = parse_params(&params)?;
            let body = if json { text } else { as_table_query(&text) };
            let url = format!("{}/query", base_url);
            let request = client.post(&url).query(&params).body(body);
            let out = send(request).await?;
            if json {
                print_json(&out);
            } else {
                println!("{}", render_table(&out));
            }
        }

        Commands::Columns { table } => {
            let url = format!("{}/tables/{}/columns", base_url, table);
            let out = send(client.get(&url)).await?;
            let mut builder = Builder::default();
            builder.push_record(["name", "type", "nested_path", "cardinality"]);
            for column in out.as_array().into_iter().flatten() {
                if column["relative"].as_bool() == Some(true) {
                    continue;
                }
                builder.push_record([
                    cell(&column["name"]),
                    cell(&column["type"]),
                    cell(&column["nested_path"]),
                    cell(&column["cardinality"]),
                ]);
            }
            println!("{}", builder.build().with(Style::modern()));
        }

        Commands::Refresh { table } => {
            let url = format!("{}/tables/{}/refresh", base_url, table);
            let out = send(client.post(&url)).await?;
            print_json(&out);
        }

        Commands::Update { table, command } => {
            let payload: Value = serde_json::from_str(&command)
                .map_err(|e| format!("update is not JSON: {}", e))?;
            let url = format!("{}/update/{}", base_url, table);
            let out = send(client.post(&url).json(&payload)).await?;
            println!(
                "Matched {} documents, {} updates applied",
                out["matched"], out["actions"]
            );
        }
    }
    Ok(())
}

fn read_query(arg: &str) -> Result<String, String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e)),
        None => Ok(arg.to_string()),
    }
}

fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    raw.iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expecting name=value, not `{}`", p))
        })
        .collect()
}

/// Ask for the `table` format unless the query names one. Text that only
/// becomes JSON after placeholder expansion is sent unchanged.
fn as_table_query(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut map)) => {
            map.entry("format").or_insert_with(|| json!("table"));
            Value::Object(map).to_string()
        }
        _ => text.to_string(),
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value, String> {
    let resp = request.send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    let body: Value = resp.json().await.map_err(|e| e.to_string())?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(format!(
            "{} ({}): {}",
            body["kind"].as_str().unwrap_or("error"),
            status,
            expand_template(&body)
        ))
    }
}

/// Fill an error's `{{name}}` template from its params.
fn expand_template(err: &Value) -> String {
    let Some(template) = err["template"].as_str() else {
        return err.to_string();
    };
    let mut out = template.to_string();
    if let Some(params) = err["params"].as_object() {
        for (k, v) in params {
            out = out.replace(&format!("{{{{{}}}}}", k), &cell(v));
        }
    }
    out
}

/// Table format results as a grid; anything else as JSON.
fn render_table(out: &Value) -> String {
    let (Some(header), Some(data)) = (out["header"].as_array(), out["data"].as_array()) else {
        return serde_json::to_string_pretty(out).unwrap_or_default();
    };
    let mut builder = Builder::default();
    builder.push_record(header.iter().map(cell));
    for row in data {
        builder.push_record(row.as_array().into_iter().flatten().map(cell));
    }
    let mut table = builder.build();
    table.with(Style::modern());
    format!("{}\n{} rows in {}s", table, data.len(), cell(&out["meta"]["timing"]["total"]))
}

fn cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_json(v: &Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
