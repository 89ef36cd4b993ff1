use clap::{App, Arg};
use graviton::config::CoreConfig;
use graviton::endpoint::{Server, ServerOptions};
use graviton::stream::channel::{self, Channel, ChannelIo, ChannelProc};
use plasma::logging;
use std::fs;
use std::sync::Arc;

/// Echoes every payload back on the channel it arrived on.
struct EchoProc;

impl ChannelProc for EchoProc {
    fn id(&self) -> u8 {
        b'E'
    }

    fn on_packet(&self, ch: &mut Channel, io: &mut ChannelIo, pkt_type: u8, data: &[u8]) {
        drop(io.send(ch, pkt_type, data));
    }
}

pub fn main() {
    let matches = App::new("Echo Node")
        .version("1.0")
        .about("Runs a standalone node with a single echo channel, for manual testing.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();

    let config: CoreConfig =
        serde_json::from_reader(fs::File::open(config_file_path).expect("Error opening config file"))
            .expect("Error parsing config file");

    let log = logging::init();

    channel::register_proc(Arc::new(EchoProc));

    let reactor = graviton::init(config.clone(), log.clone()).expect("Core init failed");

    let addrs: Vec<String> = config.listen.clone();
    let server = Server::start(&reactor, ServerOptions::new(addrs), &log).expect("Server start failed");

    drop(server);
    logging::info!(log, "echo node running"; "channels" => "E");

    // The workers run until the process is killed.
    reactor.join();
}
