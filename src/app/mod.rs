use message_retrieval_bridge::config::Config;
use message_retrieval_bridge::gating::PendingEvent;
use message_retrieval_bridge::network::NetworkId;
use message_retrieval_bridge::service::RetrievalService;
use message_retrieval_bridge::transport::loopback::{loopback, LoopbackFeed, LoopbackTransport};
use message_retrieval_bridge::transport::LoggingDispatch;
use std::io;
use tokio::io::{AsyncBufReadExt, BufReader};

type DevService = RetrievalService<LoopbackTransport<String>, LoggingDispatch>;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        match command.as_str() {
            "config-init" => return handle_config_init(),
            "run" => {}
            other => {
                return Err(format!("unknown command {other:?} (expected run or config-init)").into())
            }
        }
    }

    let (transport, feed) = loopback::<String>();
    let service = RetrievalService::new(transport, LoggingDispatch, &config);
    service.start();

    let probe_task = if config.network.probe_enabled {
        Some(service.spawn_route_probe(config.probe_target()?, config.probe_interval()))
    } else {
        tracing::info!("route probe disabled; treating network as reachable");
        service.set_network_reachable(true);
        None
    };

    println!("message retrieval dev console ready; type `help` for commands");
    let mut console = tokio::spawn(run_console(service.clone(), feed));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
        }
        res = &mut console => {
            match res {
                Ok(Ok(ConsoleExit::Quit)) => tracing::info!("shutdown: console"),
                Ok(Ok(ConsoleExit::Eof)) => {
                    tracing::info!("console input closed; waiting for ctrl-c");
                    tokio::signal::ctrl_c().await?;
                    tracing::info!("shutdown: ctrl-c");
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "console failed; waiting for ctrl-c");
                    tokio::signal::ctrl_c().await?;
                }
                Err(err) => tracing::error!(error = %err, "console task ended abnormally"),
            }
        }
    }

    service.shutdown().await;
    console.abort();
    if let Some(task) = probe_task {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "route probe task ended abnormally");
        }
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleExit {
    Quit,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    ForegroundStarted,
    ForegroundStopped,
    Push,
    Message(String),
    Bad,
    Fail,
    Network(Option<NetworkId>),
    Registered(bool),
    WebsocketEnabled(bool),
    PushDisabled(bool),
    Status,
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  fg+ | fg-            foreground started / stopped
  push                 queue a pending event (acked on next dispatch)
  msg <text>           deliver a message over the open pipe
  bad                  deliver an undecodable message
  fail                 break the open pipe
  net <id>|none        report the active network
  register on|off      registration gate
  ws on|off            websocket gate
  pushoff on|off       push channel disabled
  status               print the supervisor status
  quit";

fn parse_switch(arg: Option<&str>) -> Result<bool, String> {
    match arg {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err("expected on|off".to_string()),
    }
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, Some(rest.trim())),
        None => (line, None),
    };
    match word {
        "fg+" => Ok(Command::ForegroundStarted),
        "fg-" => Ok(Command::ForegroundStopped),
        "push" => Ok(Command::Push),
        "msg" => match rest {
            Some(text) if !text.is_empty() => Ok(Command::Message(text.to_string())),
            _ => Err("usage: msg <text>".to_string()),
        },
        "bad" => Ok(Command::Bad),
        "fail" => Ok(Command::Fail),
        "net" => match rest {
            Some("none") => Ok(Command::Network(None)),
            Some(id) if !id.is_empty() => Ok(Command::Network(Some(NetworkId::new(id)))),
            _ => Err("usage: net <id>|none".to_string()),
        },
        "register" => parse_switch(rest).map(Command::Registered),
        "ws" => parse_switch(rest).map(Command::WebsocketEnabled),
        "pushoff" => parse_switch(rest).map(Command::PushDisabled),
        "status" => Ok(Command::Status),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command {other:?}; type `help`")),
    }
}

async fn run_console(service: DevService, feed: LoopbackFeed<String>) -> io::Result<ConsoleExit> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        match command {
            Command::ForegroundStarted => {
                println!("active foreground: {}", service.notify_foreground_started());
            }
            Command::ForegroundStopped => {
                println!("active foreground: {}", service.notify_foreground_stopped());
            }
            Command::Push => {
                let (event, ack) = PendingEvent::with_ack();
                let id = event.id();
                println!("pending events: {}", service.notify_event_pending(event));
                tokio::spawn(async move {
                    if ack.await.is_ok() {
                        tracing::info!(event_id = %id, "pending event completed");
                    }
                });
            }
            Command::Message(text) => {
                feed.send(text);
            }
            Command::Bad => {
                feed.protocol_error("console injected decode failure");
            }
            Command::Fail => {
                feed.fail(io::ErrorKind::ConnectionReset);
            }
            Command::Network(network) => service.notify_connectivity_changed(network),
            Command::Registered(on) => service.set_registered(on),
            Command::WebsocketEnabled(on) => service.set_websocket_enabled(on),
            Command::PushDisabled(on) => service.set_push_channel_disabled(on),
            Command::Status => {
                let status = service.status().borrow().clone();
                match serde_json::to_string_pretty(&status) {
                    Ok(json) => println!("{json}"),
                    Err(err) => println!("status unavailable: {err}"),
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(ConsoleExit::Quit),
        }
    }
    Ok(ConsoleExit::Eof)
}
