//! `ccx` — administrative command-line client for a running codecortex
//! server. Thin `reqwest::blocking` wrapper over the HTTP/JSON API; it holds
//! no index state of its own.

use clap::{Parser, Subcommand};
use serde_json::Value;

/// Administrative command-line client for a running codecortex server.
#[derive(Parser)]
#[command(name = "ccx", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the codecortex server
    #[arg(long, global = true, default_value = "http://127.0.0.1:8070")]
    server: String,

    /// Output raw JSON instead of a formatted summary
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List all stores
    Stores,
    /// Create a new store
    CreateStore {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Delete a store (must have no active version)
    DeleteStore { name: String },
    /// Show a store's indexed-file count and version history
    Stats { store: String },
    /// Create a new building version for a store
    CreateVersion {
        store: String,
        #[arg(long, default_value = "minilm")]
        embedding_model: String,
    },
    /// Mark a version ready for promotion
    MarkReady { store: String, version: String },
    /// Promote a version to active
    Promote { store: String, version: String },
    /// Deprecate the currently active version
    Deprecate { store: String, version: String },
    /// Index files read from disk into a store
    Index {
        store: String,
        /// Paths to index, read and sent as UTF-8 content
        paths: Vec<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Delete indexed files from a store by path
    DeleteFiles { store: String, paths: Vec<String> },
    /// Run a hybrid search against a store
    Search {
        store: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long)]
        version: Option<String>,
    },
    /// Print server health and readiness
    Health,
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder().build().expect("failed to build HTTP client")
}

fn print_json_or(value: &Value, json: bool, human: impl FnOnce(&Value)) {
    if json {
        println!("{}", serde_json::to_string_pretty(value).unwrap());
    } else {
        human(value);
    }
}

fn fail_on_error(response: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        eprintln!("server returned {status}: {body}");
        std::process::exit(1);
    }
    response
}

fn get_json(base: &str, path: &str) -> Value {
    let response = fail_on_error(client().get(format!("{base}{path}")).send().unwrap_or_else(|e| {
        eprintln!("request to {base}{path} failed: {e}");
        std::process::exit(1);
    }));
    response.json().unwrap_or_else(|e| {
        eprintln!("invalid JSON response: {e}");
        std::process::exit(1);
    })
}

fn post_json(base: &str, path: &str, body: &Value) -> Value {
    let response = fail_on_error(client().post(format!("{base}{path}")).json(body).send().unwrap_or_else(|e| {
        eprintln!("request to {base}{path} failed: {e}");
        std::process::exit(1);
    }));
    response.json().unwrap_or_else(|e| {
        eprintln!("invalid JSON response: {e}");
        std::process::exit(1);
    })
}

fn delete_json(base: &str, path: &str, body: Option<&Value>) -> Value {
    let mut req = client().delete(format!("{base}{path}"));
    if let Some(b) = body {
        req = req.json(b);
    }
    let response = fail_on_error(req.send().unwrap_or_else(|e| {
        eprintln!("request to {base}{path} failed: {e}");
        std::process::exit(1);
    }));
    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Value::Null;
    }
    response.json().unwrap_or(Value::Null)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("ccx=warn".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let base = cli.server.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Stores => {
            let value = get_json(&base, "/v1/stores");
            print_json_or(&value, cli.json, |v| {
                if let Some(items) = v.as_array() {
                    for item in items {
                        println!(
                            "{:<24} active={:<10} versions={}",
                            item["name"].as_str().unwrap_or(""),
                            item["active_version"].as_str().unwrap_or("-"),
                            item["versions"].as_array().map(|a| a.len()).unwrap_or(0)
                        );
                    }
                }
            });
        }
        Commands::CreateStore { name, description } => {
            let value = post_json(&base, "/v1/stores", &serde_json::json!({ "name": name, "description": description }));
            print_json_or(&value, cli.json, |v| println!("created store {}", v["name"].as_str().unwrap_or("")));
        }
        Commands::DeleteStore { name } => {
            delete_json(&base, &format!("/v1/stores/{name}"), None);
            println!("deleted store {name}");
        }
        Commands::Stats { store } => {
            let value = get_json(&base, &format!("/v1/stores/{store}/stats"));
            print_json_or(&value, cli.json, |v| {
                println!("store:          {}", v["store"].as_str().unwrap_or(""));
                println!("active_version: {}", v["active_version"].as_str().unwrap_or("-"));
                println!("version_count:  {}", v["version_count"].as_u64().unwrap_or(0));
                println!("indexed_files:  {}", v["indexed_files"].as_u64().unwrap_or(0));
            });
        }
        Commands::CreateVersion { store, embedding_model } => {
            let value = post_json(
                &base,
                &format!("/v1/stores/{store}/versions"),
                &serde_json::json!({ "embedding_model": embedding_model }),
            );
            print_json_or(&value, cli.json, |v| println!("created version {}", v["id"].as_str().unwrap_or("")));
        }
        Commands::MarkReady { store, version } => {
            post_json(&base, &format!("/v1/stores/{store}/versions/{version}/ready"), &Value::Null);
            println!("{store}/{version} marked ready");
        }
        Commands::Promote { store, version } => {
            post_json(&base, &format!("/v1/stores/{store}/versions/{version}/promote"), &Value::Null);
            println!("{store}/{version} promoted to active");
        }
        Commands::Deprecate { store, version } => {
            post_json(&base, &format!("/v1/stores/{store}/versions/{version}/deprecate"), &Value::Null);
            println!("{store}/{version} deprecated");
        }
        Commands::Index { store, paths, version, force } => {
            let documents: Vec<Value> = paths
                .iter()
                .map(|p| {
                    let content = std::fs::read_to_string(p).unwrap_or_else(|e| {
                        eprintln!("could not read {p}: {e}");
                        std::process::exit(1);
                    });
                    serde_json::json!({ "path": p, "content": content })
                })
                .collect();
            let body = serde_json::json!({ "documents": documents, "version": version, "force": force });
            let value = post_json(&base, &format!("/v1/stores/{store}/index"), &body);
            print_json_or(&value, cli.json, |v| {
                println!(
                    "indexed={} skipped={} failed={} chunks={}",
                    v["indexed"], v["skipped"], v["failed"], v["chunks_total"]
                );
            });
        }
        Commands::DeleteFiles { store, paths } => {
            let value = delete_json(&base, &format!("/v1/stores/{store}/index"), Some(&serde_json::json!({ "paths": paths })));
            print_json_or(&value, cli.json, |v| println!("deleted {}", v["deleted"]));
        }
        Commands::Search { store, query, top_k, version } => {
            let body = serde_json::json!({ "query": query, "top_k": top_k, "version": version });
            let value = post_json(&base, &format!("/v1/stores/{store}/search"), &body);
            print_json_or(&value, cli.json, |v| {
                if let Some(results) = v["results"].as_array() {
                    for r in results {
                        println!(
                            "{:>7.3}  {}:{}-{}",
                            r["score"].as_f64().unwrap_or(0.0),
                            r["path"].as_str().unwrap_or(""),
                            r["start_line"],
                            r["end_line"]
                        );
                    }
                    eprintln!("\n{} results in {}ms", results.len(), v["took_ms"]);
                }
            });
        }
        Commands::Health => {
            let value = get_json(&base, "/v1/health");
            print_json_or(&value, cli.json, |v| println!("{}", serde_json::to_string_pretty(v).unwrap()));
        }
    }
}
