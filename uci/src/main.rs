//! UCI front end over the search controller.
//!
//! A thin shell: stdin commands map onto controller calls, search output
//! (`info`, `bestmove`) is emitted by the controller's primary worker.
//! Logging goes to stderr so protocol stdout stays clean.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use engine_config::CentralConfig;
use engine_core::{ChessPosition, EncodedMove, NullTablebase, TimeControl};
use mcts::{SearchController, UniformEvaluator};

/// ChessCoach UCI engine.
#[derive(Parser, Debug)]
#[command(name = "chesscoach-uci", about = "ChessCoach UCI engine")]
struct Args {
    /// Path to config.toml (falls back to the standard search paths).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prediction cache size in GiB (power of two), overriding config.
    #[arg(long)]
    cache_gib: Option<usize>,

    /// Search worker threads, overriding config.
    #[arg(long)]
    threads: Option<usize>,

    /// Play this many self-play games and exit instead of serving UCI.
    #[arg(long)]
    self_play: Option<u32>,

    /// Log level filter for stderr diagnostics.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_configuration(args: &Args) -> CentralConfig {
    let mut config = match &args.config {
        Some(path) => engine_config::load_from_path(path),
        None => engine_config::load_config(),
    };
    if let Some(cache_gib) = args.cache_gib {
        config.cache.request_gib = cache_gib;
        config.cache.min_gib = config.cache.min_gib.min(cache_gib);
    }
    if let Some(threads) = args.threads {
        config.workers.thread_count = threads;
    }
    config
}

fn main() -> Result<()> {
    // Keep collaborator output off the protocol stream.
    std::env::set_var("CHESSCOACH_SILENT", "1");

    let args = Args::parse();
    init_tracing(&args.log_level);
    let config = load_configuration(&args);

    // The network back end is an external collaborator; this binary wires
    // in the uniform evaluator so the engine is self-contained.
    let controller = SearchController::new(
        config,
        Box::new(UniformEvaluator::new()),
        Box::new(NullTablebase),
    )
    .context("failed to initialise the search controller")?;

    if let Some(games) = args.self_play {
        return run_self_play(&controller, games);
    }

    uci_loop(controller)
}

fn run_self_play(controller: &SearchController, games: u32) -> Result<()> {
    info!(games, "starting self-play");
    let outcomes = controller.play_self_play_games(games);
    for (index, outcome) in outcomes.iter().enumerate() {
        info!(
            game = index + 1,
            plies = outcome.plies,
            result = outcome.result as f64,
            "game complete"
        );
    }
    Ok(())
}

struct UciSession {
    controller: SearchController,
    /// Mirror of the last `position` command, used to resolve
    /// `searchmoves` tokens against legal moves.
    position: ChessPosition,
    debug: bool,
    quit: bool,
}

fn uci_loop(controller: SearchController) -> Result<()> {
    let mut session = UciSession {
        controller,
        position: ChessPosition::new(),
        debug: false,
        quit: false,
    };

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let mut tokens = line.split_whitespace();
        // Per the protocol, skip unrecognised leading tokens.
        while let Some(token) = tokens.next() {
            if session.handle_command(token, &mut tokens)? {
                break;
            }
        }
        if session.quit {
            break;
        }
    }
    Ok(())
}

impl UciSession {
    fn handle_command<'a>(
        &mut self,
        command: &str,
        rest: &mut impl Iterator<Item = &'a str>,
    ) -> Result<bool> {
        match command {
            "uci" => {
                reply(["id name ChessCoach", "id author ChessCoach team", "uciok"]);
            }
            "debug" => {
                self.debug = matches!(rest.next(), Some("on"));
                if self.debug {
                    reply([format!(
                        "info string hashfull {} cachehits {}",
                        self.controller.cache_permille_full(),
                        self.controller.cache_permille_hits()
                    )
                    .as_str()]);
                }
            }
            "isready" => {
                self.controller.wait_until_ready();
                reply(["readyok"]);
            }
            "setoption" => {
                // Options are accepted but none are defined yet.
                let ignored = rest.collect::<Vec<_>>().join(" ");
                debug!(options = %ignored, "setoption ignored");
            }
            "register" => {}
            "ucinewgame" => {
                self.position = ChessPosition::new();
                self.controller
                    .update_position(&self.position.fen(), &[], true)
                    .ok();
            }
            "position" => self.handle_position(rest),
            "go" => self.handle_go(rest),
            "stop" => self.controller.stop(),
            "ponderhit" => self.controller.ponder_hit(),
            "quit" => {
                self.controller.stop();
                self.quit = true;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn handle_position<'a>(&mut self, rest: &mut impl Iterator<Item = &'a str>) {
        let tokens: Vec<&str> = rest.collect();
        let moves_at = tokens.iter().position(|&t| t == "moves");
        let moves: Vec<String> = match moves_at {
            Some(index) => tokens[index + 1..].iter().map(|t| t.to_string()).collect(),
            None => Vec::new(),
        };

        let fen = match tokens.first() {
            Some(&"fen") => {
                // Trust the FEN up to the optional "moves" keyword.
                tokens[1..moves_at.unwrap_or(tokens.len())].join(" ")
            }
            // "startpos" or anything unrecognised.
            _ => ChessPosition::new().fen(),
        };

        let mut mirror = match ChessPosition::from_fen(&fen) {
            Ok(position) => position,
            Err(error) => {
                warn!(%error, fen = %fen, "rejecting position command");
                return;
            }
        };
        for token in &moves {
            match mirror.parse_uci_move(token) {
                Some(m) => mirror.apply_move(&m),
                None => {
                    warn!(token = %token, "illegal move in position command");
                    return;
                }
            }
        }

        if let Err(error) = self.controller.update_position(&fen, &moves, false) {
            warn!(%error, "controller rejected position");
            return;
        }
        self.position = mirror;
    }

    fn handle_go<'a>(&mut self, rest: &mut impl Iterator<Item = &'a str>) {
        fn next_number<'a>(rest: &mut impl Iterator<Item = &'a str>) -> u64 {
            rest.next().and_then(|v| v.parse().ok()).unwrap_or(0)
        }

        let mut tc = TimeControl::default();
        let mut pending_searchmoves = false;

        while let Some(token) = rest.next() {
            match token {
                "infinite" => tc.infinite = true,
                "ponder" => tc.ponder = true,
                "movetime" => tc.move_time_ms = next_number(rest),
                "wtime" => tc.time_remaining_ms[0] = next_number(rest),
                "btime" => tc.time_remaining_ms[1] = next_number(rest),
                "winc" => tc.increment_ms[0] = next_number(rest),
                "binc" => tc.increment_ms[1] = next_number(rest),
                "movestogo" => tc.moves_to_go = next_number(rest) as u32,
                "depth" => tc.depth = next_number(rest) as u32,
                "nodes" => tc.nodes = next_number(rest),
                "mate" => tc.mate = next_number(rest) as u32,
                "searchmoves" => pending_searchmoves = true,
                move_token if pending_searchmoves => {
                    if let Some(m) = self.position.parse_uci_move(move_token) {
                        tc.search_moves.push(EncodedMove::encode(&m));
                    } else {
                        warn!(move_token, "ignoring unknown searchmoves entry");
                    }
                }
                _ => {}
            }
        }

        self.controller.go(&tc);
    }
}

fn reply<'a>(lines: impl IntoIterator<Item = &'a str>) {
    let mut stdout = std::io::stdout().lock();
    for line in lines {
        let _ = writeln!(stdout, "{line}");
    }
    let _ = stdout.flush();
}
