//! Line-oriented command shell over a [`NodeFacade`].
//!
//! Reads one command per line from any `BufRead` and writes replies to any
//! `Write`, so tests drive it with in-memory buffers and the binary with
//! stdin/stdout. Interactive questions (email, confirmations) are read from
//! the same input.

use std::io::{BufRead, Write};

use tracing::debug;

use crate::{
    error::AppError,
    keys::{KeyOutcome, KeyPrompts},
    node::{NodeError, NodeFacade},
    relay::{Delivery, MessageState},
};

const HELP: &str = "\
commands:
  whoami                              show this node's identity
  set_prompt <text>                   change the prompt (blank restores default)
  gen_keys                            generate and bind a new key pair
  add_peer <name> <fingerprint> <address>
  peers                               list registered peers
  peer <fingerprint>                  look up one peer
  send <fingerprint> <payload...>     queue a message for relay
  messages                            list queued messages
  deliver <message-id>                attempt delivery of one message
  ack <message-id>                    drop a delivered message
  tick                                run one relay pass
  list_core | drop_core               developer commands
  help | exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Print `question`, read one line. EOF is an error.
pub fn ask_line<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
) -> Result<String, AppError> {
    write!(output, "{question}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(AppError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(line.trim().to_string())
}

fn ask_yes_no<R: BufRead, W: Write>(input: &mut R, output: &mut W, question: &str) -> bool {
    match ask_line(input, output, &format!("{question} [y/N] ")) {
        Ok(answer) => matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

/// Confirmation prompts read from the shell's own input.
struct LinePrompts<'s, R, W> {
    input: &'s mut R,
    output: &'s mut W,
}

impl<R: BufRead, W: Write> KeyPrompts for LinePrompts<'_, R, W> {
    fn confirm_overwrite(&mut self, current_fingerprint: &str) -> bool {
        ask_yes_no(
            &mut *self.input,
            &mut *self.output,
            &format!("This node already has keys ({current_fingerprint}). Overwrite them?"),
        )
    }

    fn confirm_binding(&mut self, name: &str, email: Option<&str>) -> bool {
        let who = match email {
            Some(e) => format!("{name} <{e}>"),
            None => format!("{name} (no email)"),
        };
        ask_yes_no(&mut *self.input, &mut *self.output, &format!("Bind the new key to {who}?"))
    }
}

pub struct Shell<'n, R, W> {
    node: &'n NodeFacade,
    input: R,
    output: W,
}

impl<'n, R: BufRead, W: Write> Shell<'n, R, W> {
    pub fn new(node: &'n NodeFacade, input: R, output: W) -> Self {
        Self { node, input, output }
    }

    /// Run until `exit` or end of input.
    pub fn run(&mut self) -> Result<(), AppError> {
        loop {
            let prompt = self
                .node
                .who_am_i()
                .map(|w| w.prompt)
                .unwrap_or_else(|_| "pterm> ".to_string());
            write!(self.output, "{prompt}")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output, "\nExiting...")?;
                return Ok(());
            }
            if self.execute(&line)? == Flow::Exit {
                return Ok(());
            }
        }
    }

    /// Run one command line.
    pub fn execute(&mut self, line: &str) -> Result<Flow, AppError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        let (command, args) = match line.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };
        debug!(%command, "shell command");

        let result = match command {
            "whoami" => self.whoami(),
            "set_prompt" => self.set_prompt(args),
            "gen_keys" => self.gen_keys(),
            "add_peer" => self.add_peer(args),
            "peers" => self.peers(),
            "peer" => self.peer(args),
            "send" => self.send(args),
            "messages" => self.messages(),
            "deliver" => self.deliver(args),
            "ack" => self.ack(args),
            "tick" => self.tick(),
            "list_core" => self.list_core(),
            "drop_core" => self.drop_core(),
            "help" | "?" => {
                writeln!(self.output, "{HELP}")?;
                Ok(())
            }
            "exit" | "quit" | "EOF" => {
                writeln!(self.output, "Exiting...")?;
                return Ok(Flow::Exit);
            }
            other => {
                writeln!(self.output, "unknown command: {other} (try `help`)")?;
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(ShellError::Node(e)) => writeln!(self.output, "error: {e}")?,
            Err(ShellError::Usage(u)) => writeln!(self.output, "usage: {u}")?,
            Err(ShellError::App(e)) => return Err(e),
        }
        Ok(Flow::Continue)
    }

    fn whoami(&mut self) -> Result<(), ShellError> {
        let who = self.node.who_am_i()?;
        writeln!(self.output, "{who}")?;
        Ok(())
    }

    fn set_prompt(&mut self, text: &str) -> Result<(), ShellError> {
        self.node.set_prompt(text)?;
        Ok(())
    }

    fn gen_keys(&mut self) -> Result<(), ShellError> {
        let Ok(email) = ask_line(&mut self.input, &mut self.output, "Email address (blank for none): ")
        else {
            writeln!(self.output, "\nAborted.")?;
            return Ok(());
        };
        let mut prompts = LinePrompts { input: &mut self.input, output: &mut self.output };
        match self.node.generate_keys(&email, &mut prompts)? {
            KeyOutcome::Generated(keys) => {
                writeln!(self.output, "Generated key {}", keys.fingerprint)?;
            }
            KeyOutcome::Aborted(reason) => writeln!(self.output, "Aborted: {reason}")?,
        }
        Ok(())
    }

    fn add_peer(&mut self, args: &str) -> Result<(), ShellError> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let [name, fingerprint, address] = parts.as_slice() else {
            return Err(ShellError::Usage("add_peer <name> <fingerprint> <address>"));
        };
        let peer = self.node.register_peer(name, fingerprint, address)?;
        writeln!(self.output, "Registered peer #{} {}", peer.id, peer.name)?;
        Ok(())
    }

    fn peers(&mut self) -> Result<(), ShellError> {
        let peers = self.node.peers()?;
        if peers.is_empty() {
            writeln!(self.output, "No peers registered.")?;
        }
        for p in peers {
            writeln!(self.output, "#{} {} {} {}", p.id, p.name, p.fingerprint, p.address)?;
        }
        Ok(())
    }

    fn peer(&mut self, fingerprint: &str) -> Result<(), ShellError> {
        if fingerprint.is_empty() {
            return Err(ShellError::Usage("peer <fingerprint>"));
        }
        let p = self.node.lookup_peer(fingerprint)?;
        writeln!(self.output, "#{} {} {} {}", p.id, p.name, p.fingerprint, p.address)?;
        Ok(())
    }

    fn send(&mut self, args: &str) -> Result<(), ShellError> {
        let Some((destination, payload)) = args.split_once(char::is_whitespace) else {
            return Err(ShellError::Usage("send <fingerprint> <payload...>"));
        };
        let id = self.node.send_message(destination, payload.trim())?;
        writeln!(self.output, "Queued {id}")?;
        Ok(())
    }

    fn messages(&mut self) -> Result<(), ShellError> {
        let messages = self.node.messages()?;
        if messages.is_empty() {
            writeln!(self.output, "Relay queue is empty.")?;
        }
        for m in messages {
            let state = match m.state() {
                MessageState::Pending => "pending",
                MessageState::Attempting => "attempting",
                MessageState::Delivered => "delivered",
            };
            let last = m
                .last_forwarding_attempt
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            writeln!(
                self.output,
                "{} -> {} [{state}] attempts={} last_attempt={last}",
                m.id, m.destination, m.attempts
            )?;
        }
        Ok(())
    }

    fn deliver(&mut self, id: &str) -> Result<(), ShellError> {
        if id.is_empty() {
            return Err(ShellError::Usage("deliver <message-id>"));
        }
        match self.node.deliver(id)? {
            Delivery::Delivered => writeln!(self.output, "Delivered.")?,
            Delivery::AlreadyDelivered => writeln!(self.output, "Already delivered.")?,
            Delivery::InFlight => writeln!(self.output, "Delivery already in progress.")?,
        }
        Ok(())
    }

    fn ack(&mut self, id: &str) -> Result<(), ShellError> {
        if id.is_empty() {
            return Err(ShellError::Usage("ack <message-id>"));
        }
        self.node.acknowledge(id)?;
        writeln!(self.output, "Acknowledged.")?;
        Ok(())
    }

    fn tick(&mut self) -> Result<(), ShellError> {
        let r = self.node.tick()?;
        writeln!(
            self.output,
            "attempted={} delivered={} retrying={} in_flight={} purged_delivered={} purged_expired={}",
            r.attempted, r.delivered, r.retrying, r.in_flight, r.purged_delivered, r.purged_expired
        )?;
        Ok(())
    }

    fn list_core(&mut self) -> Result<(), ShellError> {
        for record in self.node.list_core()? {
            writeln!(self.output, "{record:?}")?;
        }
        Ok(())
    }

    fn drop_core(&mut self) -> Result<(), ShellError> {
        let confirmed = ask_yes_no(
            &mut self.input,
            &mut self.output,
            "This destroys the node identity. Continue?",
        );
        if !confirmed {
            writeln!(self.output, "Aborted.")?;
            return Ok(());
        }
        let (input, output) = (&mut self.input, &mut self.output);
        let who = self
            .node
            .drop_core(|| ask_line(input, output, "Enter a name for this node: "))?;
        writeln!(self.output, "Identity reset; node is now {}", who.name)?;
        Ok(())
    }
}

/// Command-level failure: node errors and usage mistakes are reported to the
/// user; I/O on the shell's own streams ends the session.
enum ShellError {
    Node(NodeError),
    Usage(&'static str),
    App(AppError),
}

impl From<NodeError> for ShellError {
    fn from(e: NodeError) -> Self {
        ShellError::Node(e)
    }
}

impl From<AppError> for ShellError {
    fn from(e: AppError) -> Self {
        ShellError::App(e)
    }
}

impl From<std::io::Error> for ShellError {
    fn from(e: std::io::Error) -> Self {
        ShellError::App(AppError::Io(e))
    }
}
