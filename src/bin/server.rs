//! Audio streaming server binary
//!
//! Captures system audio and serves it to LAN listeners over TCP/UDP, plus
//! a WebSocket port for browsers.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiocast::{
    audio::{device::list_endpoints, LoopbackCapture},
    config::{parse_bind_spec, CaptureConfig},
    constants::MAX_PORT,
    network::{address, StreamServer},
    protocol::Encoding,
    websocket::WsGateway,
};

const BIN_NAME: &str = "audiocast-server";

#[derive(Default)]
struct Args {
    /// Value of `--bind`; `Some("")` for a bare `-b`
    bind: Option<String>,
    websocket_port: u16,
    endpoint: Option<String>,
    encoding: Option<String>,
    channels: u16,
    sample_rate: u32,
    list_endpoint: bool,
    list_encoding: bool,
    verbose: bool,
    version: bool,
    help: bool,
}

fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n");
            print_help();
            std::process::exit(1);
        }
    };

    if args.help {
        print_help();
        return Ok(());
    }
    if args.version {
        println!("{BIN_NAME} {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let default_level = if args.verbose { "trace" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_encoding {
        println!("encoding list:");
        println!("\tdefault\t\tDefault encoding");
        println!("\tf32\t\t32 bit floating-point PCM");
        println!("\ts8\t\t8 bit integer PCM");
        println!("\ts16\t\t16 bit integer PCM");
        println!("\ts24\t\t24 bit integer PCM");
        println!("\ts32\t\t32 bit integer PCM");
        return Ok(());
    }

    if args.list_endpoint {
        let endpoints = list_endpoints();
        println!("endpoint list:");
        for endpoint in &endpoints {
            let marker = if endpoint.is_default { '*' } else { ' ' };
            println!("\t{} id: {}  name: {}", marker, endpoint.id, endpoint.name);
        }
        println!("total: {}", endpoints.len());
        return Ok(());
    }

    let Some(bind) = args.bind else {
        print_help();
        return Ok(());
    };

    let spec = match parse_bind_spec(&bind) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let host = match spec.host {
        Some(host) => host,
        None => match address::default_address() {
            Some(addr) => addr.to_string(),
            None => {
                tracing::error!("No valid network address found. Please specify a host address.");
                std::process::exit(1);
            }
        },
    };

    let encoding = match args.encoding.as_deref() {
        None | Some("default") => None,
        Some(label) => match Encoding::from_label(label) {
            Some(encoding) => Some(encoding),
            None => {
                tracing::error!("Invalid encoding: '{label}'");
                std::process::exit(1);
            }
        },
    };

    let capture_config = CaptureConfig {
        endpoint_id: args.endpoint.unwrap_or_else(|| "default".to_string()),
        encoding,
        channels: args.channels,
        sample_rate: args.sample_rate,
    };

    let websocket_port = if args.websocket_port != 0 {
        args.websocket_port
    } else if spec.port < MAX_PORT {
        spec.port + 1
    } else {
        tracing::error!("No room for a WebSocket port above {}; use --websocket-port", spec.port);
        std::process::exit(1);
    };

    let capture = Arc::new(LoopbackCapture::new());
    let server = Arc::new(StreamServer::new(capture));
    if let Err(e) = server.start_server(&host, spec.port, &capture_config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }

    let handle = server.runtime_handle().context("server runtime missing")?;
    let format = server.format().context("stream format missing")?;

    let gateway = Arc::new(WsGateway::new());
    if let Err(e) = gateway.start_server(&handle, &host, websocket_port, format) {
        tracing::error!("{e}");
        server.stop_server();
        std::process::exit(1);
    }
    server.add_broadcaster(gateway.clone());

    // run until interrupted
    let (sig_tx, sig_rx) = crossbeam_channel::bounded(1);
    handle.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = sig_tx.send(());
        }
    });
    let _ = sig_rx.recv();

    tracing::info!("shutting down");
    gateway.stop_server();
    server.stop_server();
    Ok(())
}

fn parse_args<I: Iterator<Item = String>>(args: I) -> std::result::Result<Args, String> {
    let mut parsed = Args::default();
    let mut args = args.peekable();

    while let Some(arg) = args.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };

        match flag.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-v" | "--version" => parsed.version = true,
            "-V" | "--verbose" => parsed.verbose = true,
            "-l" | "--list-endpoint" => parsed.list_endpoint = true,
            "--list-encoding" => parsed.list_encoding = true,
            "-b" | "--bind" => {
                // the value is optional: a bare -b binds the default address
                let value = inline_value.or_else(|| {
                    match args.peek() {
                        Some(next) if !next.starts_with('-') => args.next(),
                        _ => None,
                    }
                });
                parsed.bind = Some(value.unwrap_or_default());
            }
            "-w" | "--websocket-port" => {
                let value = take_value(&flag, inline_value, &mut args)?;
                parsed.websocket_port = value
                    .parse()
                    .map_err(|_| format!("Invalid value for {flag}: '{value}'"))?;
            }
            "-e" | "--endpoint" => {
                parsed.endpoint = Some(take_value(&flag, inline_value, &mut args)?);
            }
            "--encoding" => {
                parsed.encoding = Some(take_value(&flag, inline_value, &mut args)?);
            }
            "--channels" => {
                let value = take_value(&flag, inline_value, &mut args)?;
                parsed.channels = value
                    .parse()
                    .map_err(|_| format!("Invalid value for {flag}: '{value}'"))?;
            }
            "--sample-rate" => {
                let value = take_value(&flag, inline_value, &mut args)?;
                parsed.sample_rate = value
                    .parse()
                    .map_err(|_| format!("Invalid value for {flag}: '{value}'"))?;
            }
            other => return Err(format!("Unknown option: '{other}'")),
        }
    }

    Ok(parsed)
}

fn take_value<I: Iterator<Item = String>>(
    flag: &str,
    inline_value: Option<String>,
    args: &mut std::iter::Peekable<I>,
) -> std::result::Result<String, String> {
    inline_value
        .or_else(|| args.next())
        .ok_or_else(|| format!("Missing value for {flag}"))
}

fn print_help() {
    println!("{BIN_NAME} - stream system audio to LAN listeners");
    println!();
    println!("Usage: {BIN_NAME} [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -h, --help                 Print usage");
    println!("  -v, --version              Show version");
    println!("  -V, --verbose              Set log level to trace");
    println!("  -l, --list-endpoint        List available endpoints");
    println!("      --list-encoding        List available encodings");
    println!("  -b, --bind [host][:port]   Server bind address; bare -b uses the default");
    println!("                             address and port");
    println!("  -w, --websocket-port PORT  WebSocket port for browsers (default: port + 1)");
    println!("  -e, --endpoint ID          Capture endpoint id (default: \"default\")");
    println!("      --encoding ENC         Capture encoding: default|f32|s8|s16|s24|s32");
    println!("      --channels N           Capture channels; 0 uses the endpoint default");
    println!("      --sample-rate HZ       Capture sample rate; 0 uses the endpoint default");
    println!();
    println!("Example:");
    println!("  {BIN_NAME} -b");
    println!("  {BIN_NAME} --bind=192.168.3.2");
    println!("  {BIN_NAME} --bind=192.168.3.2:65530 --encoding=f32 --channels=2 --sample-rate=48000");
}
