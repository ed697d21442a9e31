//! Keywarden CLI
//!
//!   keywarden serve [--port p]               → HTTP adapter
//!   keywarden create <name>                  → new key, account xpub
//!   keywarden xpub <name> [--path m/0/0]     → extended public key
//!   keywarden import <name> <file>           → attach wallet export
//!   keywarden sign <name> <file> [--strict]  → sign PSBT (binary or base64)
//!
//! Configuration comes from `KEYWARDEN_*` environment variables; a `.env`
//! file in the working directory is loaded first.
//!
//! Output format:
//!   --json     Compact JSON (default for non-tty)
//!   --pretty   Pretty-print JSON (default for tty)

use std::env;
use std::io::{self, IsTerminal, Read};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tracing::debug;

use keywarden::config::parse_network;
use keywarden::keys::parse_path;
use keywarden::logging::init_logging;
use keywarden::{Dispatcher, FileStore, Operation, OsEntropy, SignerConfig};

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }
    if opts.version {
        println!("keywarden {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("serve") => cmd_serve(&opts),
        Some("create") => cmd_create(&opts),
        Some("xpub") => cmd_xpub(&opts),
        Some("import") => cmd_import(&opts),
        Some("sign") => cmd_sign(&opts),
        Some(cmd) => Err(anyhow!("unknown command: {cmd}")),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = !opts.json && (opts.pretty || io::stdout().is_terminal());
    match result {
        Ok((ok, output)) => {
            println!("{}", render(&output, pretty));
            if !ok {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", render(&json!({"error": format!("{e:#}")}), pretty));
            std::process::exit(2);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    positional: Vec<String>,
    path: Option<String>,
    out: Option<String>,
    network: Option<String>,
    data_dir: Option<String>,
    port: Option<u16>,
    strict: bool,
    json: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        load_dotenv(".env");

        let mut opts = ParsedArgs::default();
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            let value = args.get(i + 1).cloned();
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--json" => opts.json = true,
                "--pretty" => opts.pretty = true,
                "--strict" => opts.strict = true,
                "--path" => {
                    opts.path = value;
                    i += 1;
                }
                "--out" | "-o" => {
                    opts.out = value;
                    i += 1;
                }
                "--network" | "-n" => {
                    opts.network = value;
                    i += 1;
                }
                "--data-dir" | "-d" => {
                    opts.data_dir = value;
                    i += 1;
                }
                "--port" | "-p" => {
                    opts.port = value.and_then(|v| v.parse().ok());
                    i += 1;
                }
                _ if !arg.starts_with('-') || arg == "-" => opts.positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
            i += 1;
        }
        if !opts.positional.is_empty() {
            opts.command = Some(opts.positional.remove(0));
        }
        opts
    }

    fn arg(&self, index: usize, what: &str) -> anyhow::Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing <{what}>"))
    }
}

/// `KEY=value` lines; variables already set in the environment win.
fn load_dotenv(path: &str) {
    let Ok(contents) = std::fs::read_to_string(path) else { return };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() && env::var(key.trim()).is_err() {
                env::set_var(key.trim(), value);
            }
        }
    }
}

fn print_usage() {
    println!(
        r#"keywarden - custodial HD wallet signer

USAGE:
    keywarden <command> [args] [options]

COMMANDS:
    serve                       Start HTTP server
    create <name>               Create a key, print its account xpub
    xpub <name>                 Print the extended public key
    import <name> <file|->      Attach a wallet export (BlueWallet, Coldcard, BDK JSON, descriptor)
    sign <name> <file|->        Sign a PSBT (binary or base64)

OPTIONS:
    --path <path>               Derivation path for xpub (default: account path)
    --strict                    Fail if any owned input cannot be signed
    --out, -o <file>            Write the signed PSBT here (same encoding as input)
    --network, -n <net>         bitcoin|testnet|signet|regtest (env: KEYWARDEN_NETWORK)
    --data-dir, -d <path>       Key store directory (env: KEYWARDEN_DATA_DIR)
    --port, -p <port>           Server port (default: 8080, env: KEYWARDEN_PORT)
    --json                      Compact JSON output
    --pretty                    Pretty-print JSON
    --version, -V               Print version

ENVIRONMENT:
    KEYWARDEN_ACCOUNT_PATH      Account path for new keys (default m/48'/0'/0'/2')
    KEYWARDEN_MAX_SPEND_SAT     Per-transaction spend limit
    KEYWARDEN_HALT_ALL          Refuse every signature (1/true)
    KEYWARDEN_POLICY_LOOKAHEAD  Addresses scanned to recognise change (default 100)
    KEYWARDEN_LOG_JSON          JSON log lines on stderr (1)
    RUST_LOG                    Log filter (default info)

EXAMPLES:
    keywarden create alpha
    keywarden xpub alpha --path m/0/0
    keywarden import alpha bluewallet-export.txt
    keywarden sign alpha unsigned.psbt --out signed.psbt
"#
    );
}

fn load_config(opts: &ParsedArgs) -> anyhow::Result<SignerConfig> {
    let mut config = SignerConfig::from_env()?;
    if let Some(raw) = opts.network.as_deref() {
        let network = parse_network(raw).ok_or_else(|| anyhow!("unknown network: {raw}"))?;
        let custom_path = env::var(keywarden::config::ENV_ACCOUNT_PATH).ok().filter(|v| !v.trim().is_empty());
        config = config.with_network(network);
        if let Some(path) = custom_path {
            config = config.with_account_path(parse_path(&path)?);
        }
    }
    if let Some(dir) = opts.data_dir.as_deref() {
        config = config.with_data_dir(dir);
    }
    if let Some(port) = opts.port {
        config = config.with_port(port);
    }
    Ok(config)
}

fn dispatcher(config: &SignerConfig) -> anyhow::Result<Dispatcher> {
    let store = FileStore::open(&config.data_dir)
        .with_context(|| format!("cannot open key store at {}", config.data_dir.display()))?;
    debug!(data_dir = %config.data_dir.display(), "key store opened");
    Ok(Dispatcher::new(config, Arc::new(store), Arc::new(OsEntropy)))
}

fn read_input(source: &str) -> anyhow::Result<Vec<u8>> {
    if source == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf).context("cannot read stdin")?;
        Ok(buf)
    } else {
        std::fs::read(source).with_context(|| format!("cannot read {source}"))
    }
}

type CmdResult = anyhow::Result<(bool, Value)>;

fn finish(reply: keywarden::Reply) -> CmdResult {
    Ok((reply.is_success(), reply.body))
}

fn cmd_create(opts: &ParsedArgs) -> CmdResult {
    let name = opts.arg(0, "name")?.to_string();
    let d = dispatcher(&load_config(opts)?)?;
    finish(d.dispatch(Operation::CreateKey { name }))
}

fn cmd_xpub(opts: &ParsedArgs) -> CmdResult {
    let name = opts.arg(0, "name")?.to_string();
    let d = dispatcher(&load_config(opts)?)?;
    finish(d.dispatch(Operation::GetXpub { name, path: opts.path.clone() }))
}

fn cmd_import(opts: &ParsedArgs) -> CmdResult {
    let name = opts.arg(0, "name")?.to_string();
    let blob = read_input(opts.arg(1, "file")?)?;
    let d = dispatcher(&load_config(opts)?)?;
    finish(d.dispatch(Operation::ImportWallet { name, blob }))
}

fn cmd_sign(opts: &ParsedArgs) -> CmdResult {
    let name = opts.arg(0, "name")?.to_string();
    let psbt = read_input(opts.arg(1, "file")?)?;
    let d = dispatcher(&load_config(opts)?)?;
    let reply = d.dispatch(Operation::SignPsbt { name, psbt, strict: opts.strict });

    if let (true, Some(out)) = (reply.is_success(), opts.out.as_deref()) {
        let text = reply.body["psbt"].as_str().unwrap_or_default();
        let bytes = if reply.body["encoding"] == "binary" {
            BASE64.decode(text).context("signed PSBT")?
        } else {
            text.as_bytes().to_vec()
        };
        std::fs::write(out, bytes).with_context(|| format!("cannot write {out}"))?;
    }
    finish(reply)
}

fn cmd_serve(opts: &ParsedArgs) -> CmdResult {
    use keywarden::{install_signal_handlers, server};

    let config = load_config(opts)?;
    let d = dispatcher(&config)?;
    let port = config.port;

    let rt = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    rt.block_on(async move {
        let shutdown = install_signal_handlers();
        server::serve(d, port, shutdown).await
    })?;
    Ok((true, json!({"status": "stopped"})))
}
