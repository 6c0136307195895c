use std::net::SocketAddr;
use std::time::Duration;

use rsbot::{BotGroup, GroupConfig};

const LOGIN_WAIT: Duration = Duration::from_secs(10);

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(err) = run(&args) {
        eprintln!("swarm: {err}");
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<(), String> {
    tracing_subscriber::fmt().init();

    if args.len() < 2 {
        return Err("usage: swarm <host:port> [count] [name_prefix] [password]".to_string());
    }
    let addr: SocketAddr = args[1]
        .parse()
        .map_err(|err| format!("bad address '{}': {err}", args[1]))?;
    let count: usize = if args.len() > 2 {
        args[2]
            .parse()
            .map_err(|err| format!("bad count '{}': {err}", args[2]))?
    } else {
        1
    };
    let prefix = args.get(3).cloned().unwrap_or_else(|| "bot".to_string());
    let password = args.get(4).cloned().unwrap_or_else(|| "password".to_string());

    let config = GroupConfig {
        connect_address: addr,
        ..GroupConfig::default()
    };
    let group = BotGroup::new(config).map_err(|err| err.to_string())?;

    let mut pending = Vec::new();
    for index in 0..count {
        let username = format!("{prefix}{index}");
        match group.login(&username, &password) {
            Ok(future) => pending.push((username, future)),
            Err(err) => eprintln!("swarm: {username}: {err}"),
        }
    }

    let mut logged_in = 0;
    for (username, future) in pending {
        if future.wait_timeout(LOGIN_WAIT) {
            logged_in += 1;
        } else {
            eprintln!("swarm: {username} did not log in");
        }
    }
    println!("swarm: {logged_in}/{count} bots logged in");

    group.shutdown();
    Ok(())
}
