//! Scriptable stand-in for a Go engine, driven by the integration tests.
//!
//! Speaks the KataGo analysis protocol by default and GTP when started with
//! `--gtp` or `gtp`. Behaviour flags:
//!
//! - `--reverse-batch N`: collect N queries, answer them newest first
//! - `--progress N`: emit N in-search records before each final one
//! - `--hang`: read everything, answer nothing
//! - `--stubborn`: ignore `quit` and stdin EOF
//! - `--exit-after N`: exit on receiving the Nth query
//! - `--error-on-id ID`: reject that query
//! - `--garbage`: print an unparseable line before every answer
//! - `--stderr-chatter`: log to stderr
//! - `--straggle`: print one more analysis line after being interrupted
//! - `--reject-play`: refuse every `play` command

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use engine::codec::json::format_result;
use engine::{AnalysisResult, CandidateMove, RequestId};
use goban_common::{BoardMove, Point};
use serde_json::{json, Value};

#[derive(Debug, Default)]
struct Flags {
    gtp: bool,
    reverse_batch: usize,
    progress: u32,
    hang: bool,
    stubborn: bool,
    exit_after: Option<usize>,
    error_on_id: Option<String>,
    garbage: bool,
    stderr_chatter: bool,
    straggle: bool,
    reject_play: bool,
}

impl Flags {
    fn parse(args: &[String]) -> Self {
        let mut flags = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--gtp" | "gtp" => flags.gtp = true,
                "--reverse-batch" => {
                    flags.reverse_batch = iter.next().and_then(|v| v.parse().ok()).unwrap_or(1)
                }
                "--progress" => {
                    flags.progress = iter.next().and_then(|v| v.parse().ok()).unwrap_or(0)
                }
                "--exit-after" => flags.exit_after = iter.next().and_then(|v| v.parse().ok()),
                "--error-on-id" => flags.error_on_id = iter.next().cloned(),
                "--hang" => flags.hang = true,
                "--stubborn" => flags.stubborn = true,
                "--garbage" => flags.garbage = true,
                "--stderr-chatter" => flags.stderr_chatter = true,
                "--straggle" => flags.straggle = true,
                "--reject-play" => flags.reject_play = true,
                _ => {}
            }
        }
        flags
    }
}

type Output = Arc<Mutex<std::io::Stdout>>;

fn emit(out: &Output, line: &str) {
    let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
    // The reader may already be gone during shutdown
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

fn chatter(flags: &Flags, message: &str) {
    if flags.stderr_chatter {
        eprintln!("fake-engine: {}", message);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = Flags::parse(&args);
    let out: Output = Arc::new(Mutex::new(std::io::stdout()));

    chatter(&flags, "loading network");
    if flags.gtp {
        run_gtp(&flags, &out);
    } else {
        run_json(&flags, &out);
    }
    chatter(&flags, "input closed");

    if flags.stubborn {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
}

fn run_json(flags: &Flags, out: &Output) {
    let mut batch: Vec<(String, Value)> = Vec::new();
    let mut received = 0;

    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let Ok(query) = serde_json::from_str::<Value>(&line) else {
            emit(out, &json!({ "error": "could not parse query" }).to_string());
            continue;
        };
        let id = query["id"].as_str().unwrap_or_default().to_string();

        if let Some(action) = query["action"].as_str() {
            match action {
                "terminate" => {
                    let target = query["terminateId"].as_str().unwrap_or_default();
                    batch.retain(|(queued, _)| queued != target);
                }
                "terminate_all" => batch.clear(),
                _ => {}
            }
            emit(
                out,
                &json!({ "id": id, "action": action, "terminateId": query["terminateId"] })
                    .to_string(),
            );
            continue;
        }

        received += 1;
        if flags.exit_after == Some(received) {
            chatter(flags, "exiting on request");
            std::process::exit(3);
        }
        if flags.hang {
            continue;
        }
        if flags.error_on_id.as_deref() == Some(id.as_str()) {
            emit(
                out,
                &json!({ "id": id, "error": "Illegal move", "field": "moves" }).to_string(),
            );
            continue;
        }

        batch.push((id, query));
        if batch.len() >= flags.reverse_batch.max(1) {
            for (id, query) in batch.drain(..).rev() {
                answer_json(flags, out, &id, &query);
            }
        }
    }
}

fn answer_json(flags: &Flags, out: &Output, id: &str, query: &Value) {
    let budget = query["maxVisits"].as_u64().unwrap_or(100).max(8) as u32;
    let turn = query["moves"].as_array().map(|m| m.len() as u32).unwrap_or(0);

    for step in 1..=flags.progress {
        let visits = budget * step / (flags.progress + 1);
        let mut result = json_result(id, visits.max(1), turn);
        result.is_terminal = false;
        emit(out, &format_result(&result));
    }
    if flags.garbage {
        emit(out, "this is not json");
    }
    emit(out, &format_result(&json_result(id, budget, turn)));
}

fn json_result(id: &str, visits: u32, turn: u32) -> AnalysisResult {
    let d4 = BoardMove::Play(Point::new(3, 4));
    let q16 = BoardMove::Play(Point::new(15, 16));
    let c3 = BoardMove::Play(Point::new(2, 3));

    let shares = [(d4, 2, 0.55, 2.5), (q16, 4, 0.5, 1.0), (c3, 8, 0.45, -0.5)];
    let candidates = shares
        .iter()
        .enumerate()
        .map(|(order, &(mv, divisor, winrate, score))| {
            let mut candidate = CandidateMove::new(mv, (visits / divisor).max(1), order as u32);
            candidate.winrate = Some(winrate);
            candidate.score_lead = Some(score);
            candidate.pv = vec![mv, q16];
            candidate
        })
        .collect();

    AnalysisResult {
        id: id.parse::<RequestId>().ok(),
        candidates,
        winrate: Some(0.55),
        score_lead: Some(2.5),
        visits: Some(u64::from(visits)),
        turn_number: Some(turn),
        is_terminal: true,
    }
}

struct Search {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl Search {
    fn interrupt(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.thread.join();
    }
}

fn run_gtp(flags: &Flags, out: &Output) {
    let mut search: Option<Search> = None;
    let mut analyses = 0;

    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };

        // Every command interrupts a running search
        if let Some(running) = search.take() {
            running.interrupt();
        }

        match command {
            "quit" => {
                emit(out, "=\n");
                if !flags.stubborn {
                    return;
                }
            }
            "name" => emit(out, "= Leela Zero\n"),
            "play" if flags.reject_play => emit(out, "? illegal move\n"),
            "boardsize" | "clear_board" | "komi" | "play" | "kata-set-rules" | "lz-setoption"
            | "kata-set-param" | "clear_cache" | "stop" => emit(out, "=\n"),
            "lz-analyze" | "kata-analyze" => {
                analyses += 1;
                if flags.exit_after == Some(analyses) {
                    std::process::exit(3);
                }
                emit(out, "=");
                if !flags.hang {
                    let interval = words
                        .find_map(|w| w.parse::<u64>().ok())
                        .unwrap_or(50)
                        .max(1);
                    search = Some(start_search(
                        out.clone(),
                        Duration::from_millis(interval * 10),
                        command == "kata-analyze",
                        flags.straggle,
                    ));
                }
            }
            _ => emit(out, "? unknown command\n"),
        }
    }

    if let Some(running) = search.take() {
        running.interrupt();
    }
}

fn start_search(out: Output, interval: Duration, kata: bool, straggle: bool) -> Search {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let thread = thread::spawn(move || {
        let mut tick = 0;
        loop {
            thread::sleep(interval);
            if flag.load(Ordering::SeqCst) {
                if straggle {
                    emit(&out, "info move A1 visits 99999 winrate 10000 order 0 pv A1");
                }
                return;
            }
            tick += 1;
            emit(&out, &info_line(tick, kata));
        }
    });
    Search { stop, thread }
}

fn info_line(tick: u32, kata: bool) -> String {
    if kata {
        format!(
            "info move D4 visits {} utility 0.02 winrate 0.51 scoreMean 1.2 scoreLead 1.2 prior 0.2 lcb 0.49 order 0 pv D4 Q16 \
             info move Q16 visits {} utility -0.01 winrate 0.48 scoreMean 0.4 scoreLead 0.4 prior 0.15 lcb 0.45 order 1 pv Q16 D4",
            10 * tick,
            5 * tick
        )
    } else {
        format!(
            "info move D4 visits {} winrate 5100 prior 2000 lcb 4900 order 0 pv D4 Q16 \
             info move Q16 visits {} winrate 4800 prior 1500 lcb 4500 order 1 pv Q16 D4",
            10 * tick,
            5 * tick
        )
    }
}
