use super::pool::{Engine, EngineFactory, SearchRequest};
use super::{OracleError, Score};
use crate::config::OracleConfig;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// One principal variation reported by the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineLine {
    /// 1-based MultiPV index
    pub multipv: usize,
    pub depth: u32,
    pub score: Score,
    pub pv: Vec<String>,
}

/// Parses an `info` line carrying an exact score, e.g.
/// `info depth 12 seldepth 18 multipv 1 score cp 31 nodes 1234 pv e2e4 e7e5`.
/// Bound scores, `currmove` updates and `info string` lines yield `None`.
pub fn parse_info(line: &str) -> Option<EngineLine> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "info" {
        return None;
    }

    let mut depth = 0;
    let mut multipv = 1;
    let mut score = None;
    let mut pv = Vec::new();

    while let Some(part) = parts.next() {
        match part {
            "depth" => depth = parts.next()?.parse().ok()?,
            "multipv" => multipv = parts.next()?.parse().ok()?,
            "score" => {
                let score_type = parts.next()?;
                let score_value = parts.next()?.parse::<i32>().ok()?;
                score = Some(match score_type {
                    "cp" => Score::Cp(score_value),
                    "mate" => Score::Mate(score_value),
                    _ => return None,
                });
            }
            "lowerbound" | "upperbound" | "string" => return None,
            "pv" => {
                pv = parts.by_ref().map(str::to_string).collect();
                break;
            }
            _ => {}
        }
    }

    Some(EngineLine {
        multipv,
        depth,
        score: score?,
        pv,
    })
}

/// UCI engine process. Output is read by a dedicated thread and forwarded
/// through a channel so every wait can be bounded by a deadline.
/// https://www.wbec-ridderkerk.nl/html/UCIProtocol.html
pub struct UciEngine {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,

    /// MultiPV value currently set in the engine
    multipv: usize,
    deterministic: bool,
    stop_grace: Duration,
    alive: bool,
}

impl UciEngine {
    pub fn spawn(config: &OracleConfig) -> Result<Self, OracleError> {
        let mut child = Command::new(&config.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OracleError::Engine(format!("failed to start {}: {}", config.binary, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OracleError::Engine("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OracleError::Engine("engine stdout unavailable".to_string()))?;

        let (tx, rx) = channel::unbounded();
        thread::Builder::new()
            .name("uci-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        let mut engine = UciEngine {
            child,
            stdin,
            lines: rx,
            multipv: 1,
            deterministic: config.deterministic,
            stop_grace: Duration::from_millis(config.stop_grace_ms),
            alive: true,
        };

        let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);
        engine.send("uci")?;
        engine.wait_for("uciok", deadline)?;
        engine.send(&format!("setoption name Threads value {}", config.threads))?;
        engine.send(&format!("setoption name Hash value {}", config.hash_mb))?;
        engine.sync(deadline)?;

        tracing::debug!(binary = %config.binary, pid = engine.child.id(), "engine started");
        Ok(engine)
    }

    fn send(&mut self, command: &str) -> Result<(), OracleError> {
        let result = writeln!(self.stdin, "{}", command).and_then(|_| self.stdin.flush());
        if let Err(error) = result {
            self.alive = false;
            return Err(error.into());
        }
        Ok(())
    }

    /// Reads lines until one starts with `token`
    fn wait_for(&mut self, token: &str, deadline: Instant) -> Result<(), OracleError> {
        loop {
            match self.lines.recv_deadline(deadline) {
                Ok(line) if line.starts_with(token) => return Ok(()),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Err(OracleError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    self.alive = false;
                    return Err(OracleError::Engine("engine exited".to_string()));
                }
            }
        }
    }

    fn sync(&mut self, deadline: Instant) -> Result<(), OracleError> {
        self.send("isready")?;
        self.wait_for("readyok", deadline)
    }

    pub fn search(
        &mut self,
        request: &SearchRequest,
        deadline: Instant,
    ) -> Result<Vec<EngineLine>, OracleError> {
        // leftovers of a previous search
        while self.lines.try_recv().is_ok() {}

        if request.lines != self.multipv {
            self.send(&format!("setoption name MultiPV value {}", request.lines))?;
            self.multipv = request.lines;
        }
        if self.deterministic {
            self.send("ucinewgame")?;
        }
        self.sync(deadline)?;

        self.send(&format!("position fen {}", request.fen))?;
        self.send(&format!("go depth {}", request.depth))?;

        // latest line for each multipv index
        let mut best = BTreeMap::new();
        loop {
            match self.lines.recv_deadline(deadline) {
                Ok(line) => {
                    if line.starts_with("bestmove") {
                        break;
                    }
                    if let Some(info) = parse_info(&line) {
                        if info.multipv <= request.lines {
                            best.insert(info.multipv, info);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.abort_search();
                    return Err(OracleError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.alive = false;
                    return Err(OracleError::Engine("engine exited during search".to_string()));
                }
            }
        }

        if best.is_empty() {
            return Err(OracleError::Engine(format!(
                "no evaluation for {}",
                request.fen
            )));
        }
        Ok(best.into_values().collect())
    }

    /// Stops the running search. An engine that does not answer `stop` within
    /// the grace period is killed.
    fn abort_search(&mut self) {
        let grace = Instant::now() + self.stop_grace;
        let stopped = self.send("stop").and_then(|_| self.wait_for("bestmove", grace));
        if let Err(error) = stopped {
            tracing::warn!(%error, pid = self.child.id(), "engine ignored stop, killing it");
            self.kill();
        }
    }

    fn kill(&mut self) {
        self.alive = false;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Engine for UciEngine {
    fn search(
        &mut self,
        request: &SearchRequest,
        deadline: Instant,
    ) -> Result<Vec<EngineLine>, OracleError> {
        UciEngine::search(self, request, deadline)
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        if self.alive {
            let _ = self.send("quit");
        }
        self.kill();
    }
}

/// Spawns `UciEngine`s with the configured options
pub struct UciEngineFactory {
    config: OracleConfig,
}

impl UciEngineFactory {
    pub fn new(config: OracleConfig) -> Self {
        UciEngineFactory { config }
    }
}

impl EngineFactory for UciEngineFactory {
    type Engine = UciEngine;

    fn spawn(&self) -> Result<UciEngine, OracleError> {
        UciEngine::spawn(&self.config)
    }
}
