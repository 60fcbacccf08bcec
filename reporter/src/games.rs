use sysinfo::{ProcessesToUpdate, System};

/// Lists running process names. Keeps one `System` across scans so
/// refreshes only pick up what changed.
pub struct ProcessScanner {
    system: System,
}

impl Default for ProcessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn running(&mut self) -> Vec<String> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        self.system
            .processes()
            .values()
            .map(|process| process.name().to_string_lossy().into_owned())
            .collect()
    }
}

/// Case-insensitive match of any process name against the configured games.
/// A pattern also matches with a trailing `.exe` stripped (Proton/Wine).
pub fn find_game<'a>(processes: &'a [String], games: &[String]) -> Option<&'a str> {
    processes
        .iter()
        .map(String::as_str)
        .find(|process| {
            let process = process.to_ascii_lowercase();
            let bare = process.strip_suffix(".exe").unwrap_or(&process);
            games.iter().any(|game| {
                let game = game.to_ascii_lowercase();
                let game = game.strip_suffix(".exe").unwrap_or(&game);
                !game.is_empty() && bare == game
            })
        })
}

pub fn parse_game_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|game| !game.is_empty())
        .map(str::to_string)
        .collect()
}
