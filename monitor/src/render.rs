use crate::classifier::AlertEpisode;
use crate::instance::InstanceMonitor;
use crate::view::{Illustration, LifecycleView};

/// Draws the monitor state to the terminal, only when something changed.
pub struct TerminalRenderer {
    enabled: bool,
    last_status_line: Option<String>,
    last_view: Option<LifecycleView>,
    last_alert: Option<AlertEpisode>,
}

impl TerminalRenderer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_status_line: None,
            last_view: None,
            last_alert: None,
        }
    }

    pub fn render(&mut self, monitor: &InstanceMonitor) {
        let state = monitor.state();
        let status_line = format!(
            "[{}] status: {} | stream: {}",
            state.instance_key,
            state
                .status()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "loading".to_string()),
            match state.connection.active_session() {
                Some(session) => format!("connected ({})", session),
                None => "disconnected".to_string(),
            }
        );
        if self.last_status_line.as_ref() != Some(&status_line) {
            self.print(&status_line);
            self.last_status_line = Some(status_line);
        }

        let view = monitor.view();
        if self.last_view != Some(view) {
            self.draw_view(view);
            self.last_view = Some(view);
        }

        let alert = monitor.alert().cloned();
        if self.last_alert != alert {
            match &alert {
                Some(episode) => self.draw_alert(episode),
                None if self.last_alert.is_some() => self.print("(alert closed)"),
                None => {}
            }
            self.last_alert = alert;
        }
    }

    /// Console output passes straight through unless a block covers the UI.
    pub fn console_line(&self, monitor: &InstanceMonitor, line: &str) {
        if !monitor.view().is_blocking() {
            self.print(&format!("> {}", line));
        }
    }

    fn draw_view(&self, view: LifecycleView) {
        match view.block() {
            Some(block) => {
                let icon = match block.image {
                    Illustration::ServerInstalling => "[~]",
                    Illustration::ServerError => "[!]",
                    Illustration::ServerRestore => "[<]",
                };
                self.print(&format!("{} {}", icon, block.title));
                self.print(&format!("    {}", block.message));
            }
            None => self.print("Console attached."),
        }
    }

    fn draw_alert(&self, episode: &AlertEpisode) {
        self.print(&format!("/!\\ {}", episode.body.title()));
        for paragraph in episode.body.paragraphs() {
            self.print(&format!("    {}", paragraph));
        }
        self.print("    (type 'd' and press enter to dismiss)");
    }

    fn print(&self, text: &str) {
        if self.enabled {
            println!("{}", text);
        }
    }
}
