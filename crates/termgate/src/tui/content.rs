//! Static screen text and the built-in command table.

pub const PROTOCOL_BANNER: &str = "TERMGATE/1";

/// Placeholder shown in the header before a vector is chosen.
pub const NO_VECTOR: &str = "NONE";

pub const FAREWELL: &str = "connection closed. signal lost.";
pub const IDLE_NOTICE: &str = "idle timeout reached. disconnecting.";

/// Triage hotkeys and the vectors they select.
pub const VECTORS: [(char, &str); 3] = [('a', "signal"), ('b', "archive"), ('c', "relay")];

pub fn vector_for_hotkey(key: char) -> Option<&'static str> {
    VECTORS
        .iter()
        .find(|(hotkey, _)| *hotkey == key)
        .map(|(_, name)| *name)
}

pub fn motd_lines() -> Vec<String> {
    [
        "",
        "  ████ TERMGATE ████",
        "",
        "  you have reached a monitored terminal.",
        "  all activity on this line is observed.",
        "",
        "  press ENTER to continue, or jump straight to a vector:",
        "    [a] signal   [b] archive   [c] relay",
        "",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn triage_lines() -> Vec<String> {
    let mut lines = vec![String::new(), "  TRIAGE: select a vector".to_string()];
    lines.extend(
        VECTORS
            .iter()
            .map(|(key, name)| format!("    [{key}] {name}")),
    );
    lines.push("  ESC returns to the message of the day.".to_string());
    lines
}

pub fn engaged_lines(vector: &str) -> Vec<String> {
    vec![
        format!("vector {vector} engaged."),
        "type `help` for commands. ctrl+d disconnects.".to_string(),
    ]
}

/// Result of running a command typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Lines(Vec<String>),
    Clear,
    Motd,
}

/// Facts a command may report back about the session.
pub struct CommandContext<'a> {
    pub user: &'a str,
    pub observer: &'a str,
    pub vector: Option<&'a str>,
}

pub fn run_command(input: &str, ctx: &CommandContext<'_>) -> Response {
    let mut words = input.split_whitespace();
    let Some(command) = words.next() else {
        return Response::Lines(Vec::new());
    };

    match command {
        "help" => Response::Lines(vec![
            "commands:".to_string(),
            "  help     this list".to_string(),
            "  clear    clear the screen".to_string(),
            "  whoami   show your identity".to_string(),
            "  vector   show the active vector".to_string(),
            "  motd     show the message of the day".to_string(),
            "  exit     how to leave".to_string(),
        ]),
        "clear" => Response::Clear,
        "whoami" => Response::Lines(vec![format!(
            "{} (observer {})",
            ctx.user, ctx.observer
        )]),
        "vector" => Response::Lines(vec![format!(
            "active vector: {}",
            ctx.vector.unwrap_or(NO_VECTOR)
        )]),
        "motd" => Response::Motd,
        "exit" | "quit" | "logout" => {
            Response::Lines(vec!["press ctrl+d to disconnect.".to_string()])
        }
        other => Response::Lines(vec![format!("{other}: command not found")]),
    }
}
