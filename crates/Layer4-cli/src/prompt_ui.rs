//! Terminal responder for SSH prompts
//!
//! Subscribes to the broker and answers the head of the queue on the
//! terminal. Credentials are read with echo off.

use anvil_foundation::{PromptBroker, PromptEvent, PromptKind, PromptQueue, PromptRequest};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Text shown for a prompt
pub fn format_prompt(request: &PromptRequest) -> String {
    let mut text = String::new();
    if request.kind == PromptKind::HostKey {
        text.push_str("\nUnknown SSH host key");
        if let Some(host) = &request.host {
            text.push_str(&format!(" for {}", host));
        }
        text.push('\n');
        if let (Some(key_type), Some(fingerprint)) = (&request.key_type, &request.fingerprint) {
            text.push_str(&format!("  {} {}\n", key_type, fingerprint));
        }
    }
    text.push_str(request.prompt.trim_end());
    if !text.ends_with(' ') {
        text.push(' ');
    }
    text
}

fn read_line() -> io::Result<String> {
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_secret_raw() -> io::Result<String> {
    let mut secret = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(secret),
            KeyCode::Backspace => {
                secret.pop();
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "prompt cancelled"));
            }
            KeyCode::Esc => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "prompt cancelled"));
            }
            KeyCode::Char(c) => secret.push(c),
            _ => {}
        }
    }
}

fn read_secret() -> io::Result<String> {
    if !io::stdin().is_terminal() {
        return read_line();
    }
    terminal::enable_raw_mode()?;
    let result = read_secret_raw();
    let _ = terminal::disable_raw_mode();
    eprintln!();
    result
}

/// Blocking terminal interaction for one prompt
fn ask_terminal(request: PromptRequest) -> io::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", format_prompt(&request))?;
    stderr.flush()?;
    if request.secret {
        read_secret()
    } else {
        read_line()
    }
}

/// Apply events that arrived while the terminal was busy
fn drain(events: &mut Receiver<PromptEvent>, queue: &mut PromptQueue, broker: &PromptBroker) {
    loop {
        match events.try_recv() {
            Ok(event) => queue.apply(event),
            Err(TryRecvError::Lagged(_)) => {
                *queue = PromptQueue::from_pending(broker.pending());
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

/// Answer prompts on the terminal until the task is aborted
pub fn spawn_responder(broker: Arc<PromptBroker>) -> JoinHandle<()> {
    let mut events = broker.subscribe();
    let mut queue = PromptQueue::from_pending(broker.pending());

    tokio::spawn(async move {
        loop {
            drain(&mut events, &mut queue, &broker);

            while let Some(head) = queue.head().cloned() {
                let request_id = head.request_id.clone();
                let answer = match tokio::task::spawn_blocking(move || ask_terminal(head)).await {
                    Ok(Ok(answer)) => Some(answer),
                    Ok(Err(e)) => {
                        debug!("prompt not answered: {}", e);
                        None
                    }
                    Err(e) => {
                        warn!("prompt reader failed: {}", e);
                        None
                    }
                };

                // the prompt may have timed out while we were reading
                drain(&mut events, &mut queue, &broker);
                if !queue.contains(&request_id) {
                    eprintln!("(prompt expired)");
                    continue;
                }

                let result = match answer {
                    Some(answer) => queue.respond_head(broker.as_ref(), &answer).await,
                    None => queue.dismiss_head(broker.as_ref()).await,
                };
                if let Err(e) = result {
                    warn!(request_id = %request_id, "failed to deliver prompt answer: {}", e);
                    queue = PromptQueue::from_pending(broker.pending());
                }
            }

            match events.recv().await {
                Ok(event) => queue.apply(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "prompt events lagged, resyncing");
                    queue = PromptQueue::from_pending(broker.pending());
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_host_key_prompt() {
        let mut request = PromptRequest::new(
            "s",
            PromptKind::HostKey,
            "Are you sure you want to continue connecting (yes/no/[fingerprint])?",
        );
        request.host = Some("build.local".into());
        request.key_type = Some("ED25519".into());
        request.fingerprint = Some("SHA256:abc".into());

        let text = format_prompt(&request);
        assert!(text.contains("for build.local"));
        assert!(text.contains("ED25519 SHA256:abc"));
        assert!(text.ends_with("(yes/no/[fingerprint])? "));
    }

    #[test]
    fn test_format_credential_prompt() {
        let request = PromptRequest::new("s", PromptKind::Credential, "dev@box's password: ");
        assert!(request.secret);
        assert_eq!(format_prompt(&request), "dev@box's password: ");
    }
}
