//! # Command Line Interface
//!
//! The binary wires a channel to a `gemdos::Server` and polls it forever.
//! Set RUST_LOG environment variable to control logging level.

use clap::{arg,crate_version,Command,ArgAction};
use env_logger;
use log::{error,info};
use stbridge::bus::{Select,sock::SocketChannel};
use stbridge::transport::DataTransport;
use stbridge::gemdos::Server;

const RCH: &str = "unreachable was reached";

fn main() -> Result<(),Box<dyn std::error::Error>>
{
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let long_help =
"stbridge serves host directories to a vintage Atari as GEMDOS drives.
Set RUST_LOG environment variable to control logging level.
  levels: trace,debug,info,warn,error

Examples:
---------
serve one drive:       `stbridge serve -s /tmp/bridge.sock -d C=/home/me/atari`
serve a read-only CD:  `stbridge serve -s /tmp/bridge.sock -d C=/srv/share -d D=/mnt/cd:ro`
drives from a file:    `stbridge serve -s /tmp/bridge.sock -m drives.json`
check a drive map:     `stbridge check -m drives.json`";

    let mut main_cmd = Command::new("stbridge")
        .about("Serves host directories to a vintage Atari as GEMDOS drives.")
        .after_long_help(long_help)
        .version(crate_version!());
    main_cmd = main_cmd.subcommand(Command::new("serve")
        .arg(arg!(-s --sock <PATH> "socket where the bus device connects").required(true))
        .arg(arg!(-d --drive <SPEC> "drive mapping like C=/host/path or C=/host/path:ro")
            .required(false).action(ArgAction::Append))
        .arg(arg!(-m --map <PATH> "JSON file with drive mappings").required(false))
        .arg(arg!(--connect "connect to the socket instead of listening on it").action(ArgAction::SetTrue))
        .about("serve drives to the guest until interrupted"));
    main_cmd = main_cmd.subcommand(Command::new("check")
        .arg(arg!(-d --drive <SPEC> "drive mapping like C=/host/path or C=/host/path:ro")
            .required(false).action(ArgAction::Append))
        .arg(arg!(-m --map <PATH> "JSON file with drive mappings").required(false))
        .about("parse drive mappings and print the resulting table"));

    let matches = main_cmd.get_matches();

    if let Some(cmd) = matches.subcommand_matches("serve") {
        let drives = gather_drives(cmd)?;
        if drives.is_empty() {
            error!("no drives given, nothing to serve");
            return Err(Box::new(stbridge::gemdos::types::CommandError::InvalidCommand));
        }
        let sock_path = cmd.get_one::<String>("sock").expect(RCH);
        let channel = match cmd.get_flag("connect") {
            true => SocketChannel::connect(sock_path)?,
            false => SocketChannel::listen(sock_path)?
        };
        let trans = DataTransport::new(Box::new(channel),Select::Disk);
        let mut server = Server::new(trans);
        for (idx,root,ro) in &drives {
            server.set_drive(*idx,root,*ro)?;
        }
        info!("serving {} drive(s) on {}",drives.len(),sock_path);
        loop {
            match server.poll(1000) {
                Ok(_handled) => {},
                Err(e) => {
                    error!("bus fault: {}",e);
                    return Err(e);
                }
            }
        }
    }

    if let Some(cmd) = matches.subcommand_matches("check") {
        let drives = gather_drives(cmd)?;
        for (idx,root,ro) in &drives {
            println!("{}: -> {}{}",(b'A'+*idx as u8) as char,root.display(),
                match ro { true => " (read only)", false => "" });
        }
        return Ok(());
    }

    error!("No subcommand was found, try `stbridge --help`");
    Err(Box::new(stbridge::gemdos::types::CommandError::InvalidCommand))
}

fn gather_drives(cmd: &clap::ArgMatches) -> Result<Vec<(usize,std::path::PathBuf,bool)>,Box<dyn std::error::Error>> {
    let mut ans = Vec::new();
    if let Some(map_path) = cmd.get_one::<String>("map") {
        ans.append(&mut stbridge::load_drive_map(map_path)?);
    }
    if let Some(specs) = cmd.get_many::<String>("drive") {
        for spec in specs {
            ans.push(stbridge::parse_drive_spec(spec)?);
        }
    }
    Ok(ans)
}
