use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::types::Line;

/// Capacity of the channel every tail writes into.
pub const LINE_BUFFER: usize = 100;

/// Merges the output of all tails into one stream.
///
/// Lines received shortly after startup are held back and sorted so the
/// first screen of output from many containers reads in timestamp order.
#[derive(Debug, Clone, Copy)]
pub struct LineMultiplexer {
    /// Initial length of the startup window.
    pub startup_delay: Duration,
    /// A line arriving this close to the deadline extends the window.
    pub settle_window: Duration,
    /// How far past such a line the deadline moves.
    pub extension: Duration,
}

impl Default for LineMultiplexer {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(1),
            settle_window: Duration::from_millis(200),
            extension: Duration::from_millis(250),
        }
    }
}

/// Stable sort by leading message token, then prefix.
pub fn sort_startup_lines(lines: &mut [Line]) {
    lines.sort_by(|a, b| {
        a.sort_key()
            .cmp(b.sort_key())
            .then_with(|| a.prefix.cmp(&b.prefix))
    });
}

fn print<W: Write>(out: &mut W, line: &Line) -> io::Result<()> {
    writeln!(out, "{} {}", line.prefix, line.message)?;
    out.flush()
}

impl LineMultiplexer {
    /// Consume `lines` until every sender is gone, writing to `out`.
    pub async fn run<W: Write>(self, mut lines: mpsc::Receiver<Line>, mut out: W) -> io::Result<W> {
        let mut deadline = Instant::now() + self.startup_delay;
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);

        let mut startup = Vec::new();
        let mut closed = false;
        loop {
            tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => {
                        startup.push(line);
                        let now = Instant::now();
                        if now + self.settle_window > deadline {
                            deadline = now + self.extension;
                            timer.as_mut().reset(deadline);
                        }
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = &mut timer => break,
            }
        }

        sort_startup_lines(&mut startup);
        for line in &startup {
            print(&mut out, line)?;
        }
        drop(startup);

        if !closed {
            while let Some(line) = lines.recv().await {
                print(&mut out, &line)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(prefix: &str, message: &str) -> Line {
        Line {
            prefix: prefix.to_string(),
            message: message.to_string(),
        }
    }

    fn output(buf: Vec<u8>) -> Vec<String> {
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_sort_by_timestamp_then_prefix() {
        let mut lines = vec![
            line("web-2", "2024-01-01T00:00:01Z started"),
            line("web-1", "2024-01-01T00:00:01Z started"),
            line("web-3", "2024-01-01T00:00:00Z ready"),
        ];
        sort_startup_lines(&mut lines);
        let order: Vec<_> = lines.iter().map(|l| l.prefix.as_str()).collect();
        assert_eq!(order, vec!["web-3", "web-1", "web-2"]);
    }

    #[test]
    fn test_sort_without_spaces_uses_whole_message() {
        let mut lines = vec![line("b", "beta"), line("c", "alpha"), line("a", "alpha")];
        sort_startup_lines(&mut lines);
        let order: Vec<_> = lines
            .iter()
            .map(|l| format!("{}:{}", l.prefix, l.message))
            .collect();
        assert_eq!(order, vec!["a:alpha", "c:alpha", "b:beta"]);
    }

    #[test]
    fn test_sort_keeps_arrival_order_on_ties() {
        let mut lines = vec![
            line("a", "2024-01-01T00:00:00Z second"),
            line("a", "2024-01-01T00:00:00Z first"),
            line("a", "2023-12-31T23:59:59Z earlier"),
        ];
        sort_startup_lines(&mut lines);
        let order: Vec<_> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "2023-12-31T23:59:59Z earlier",
                "2024-01-01T00:00:00Z second",
                "2024-01-01T00:00:00Z first",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_lines_are_sorted() {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let mux = tokio::spawn(LineMultiplexer::default().run(rx, Vec::new()));

        tx.send(line("web-2", "2024-01-01T00:00:01Z started")).await.unwrap();
        tx.send(line("web-1", "2024-01-01T00:00:00Z started")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(line("web-1", "2024-01-01T00:00:00Z late")).await.unwrap();
        drop(tx);

        let out = output(mux.await.unwrap().unwrap());
        assert_eq!(
            out,
            vec![
                "web-1 2024-01-01T00:00:00Z started",
                "web-2 2024-01-01T00:00:01Z started",
                "web-1 2024-01-01T00:00:00Z late",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_near_deadline_extend_window() {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let mux = tokio::spawn(LineMultiplexer::default().run(rx, Vec::new()));

        // 900ms: inside the final 200ms, deadline moves to 1150ms
        tokio::time::sleep(Duration::from_millis(900)).await;
        tx.send(line("b", "2")).await.unwrap();
        // 1100ms: still buffered thanks to the extension
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(line("a", "1")).await.unwrap();
        // the second line extended the deadline again, to 1350ms
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(line("c", "0")).await.unwrap();
        drop(tx);

        let out = output(mux.await.unwrap().unwrap());
        assert_eq!(out, vec!["a 1", "b 2", "c 0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_flushes_buffer() {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let mux = tokio::spawn(LineMultiplexer::default().run(rx, Vec::new()));

        tx.send(line("b", "2 second")).await.unwrap();
        tx.send(line("a", "1 first")).await.unwrap();
        drop(tx);

        let out = output(mux.await.unwrap().unwrap());
        assert_eq!(out, vec!["a 1 first", "b 2 second"]);
    }
}
