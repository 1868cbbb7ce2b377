//! Maps lifecycle state to the screen the UI must show.

use crate::store::LifecycleState;
use log::warn;
use shared::InstanceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleView {
    Installing,
    Suspended,
    NodeUnderMaintenance,
    Transferring,
    RestoringBackup,
    /// No block: the normal operational UI.
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Illustration {
    ServerInstalling,
    ServerError,
    ServerRestore,
}

/// Full-screen block drawn instead of the normal UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenBlock {
    pub title: &'static str,
    pub image: Illustration,
    pub message: &'static str,
}

impl LifecycleView {
    pub fn block(self) -> Option<ScreenBlock> {
        let block = match self {
            LifecycleView::Installing => ScreenBlock {
                title: "Running Installer",
                image: Illustration::ServerInstalling,
                message: "Your server should be ready soon, please try again in a few minutes.",
            },
            LifecycleView::Suspended => ScreenBlock {
                title: "Server Suspended",
                image: Illustration::ServerError,
                message: "This server is suspended and cannot be accessed.",
            },
            LifecycleView::NodeUnderMaintenance => ScreenBlock {
                title: "Node under Maintenance",
                image: Illustration::ServerError,
                message: "The node of this server is currently under maintenance.",
            },
            LifecycleView::Transferring => ScreenBlock {
                title: "Transferring",
                image: Illustration::ServerRestore,
                message: "Your server is being transferred to a new node, please check back later.",
            },
            LifecycleView::RestoringBackup => ScreenBlock {
                title: "Restoring from Backup",
                image: Illustration::ServerRestore,
                message: "Your server is currently being restored from a backup, please check back in a few minutes.",
            },
            LifecycleView::PassThrough => return None,
        };
        Some(block)
    }

    pub fn is_blocking(self) -> bool {
        self != LifecycleView::PassThrough
    }
}

/// First match wins: installer, suspended, maintenance, transfer, restore.
/// An unknown status matches none of the status cases but the flags still
/// apply.
pub fn select_view(state: &LifecycleState) -> LifecycleView {
    let snapshot = match &state.snapshot {
        Some(snapshot) => snapshot,
        None => return LifecycleView::PassThrough,
    };
    let status = &snapshot.status;

    if let InstanceStatus::Unknown(raw) = status {
        warn!(
            "Instance {} reported unknown status {:?}",
            state.instance_key, raw
        );
    }

    if status.is_installer() {
        LifecycleView::Installing
    } else if *status == InstanceStatus::Suspended {
        LifecycleView::Suspended
    } else if snapshot.is_node_under_maintenance {
        LifecycleView::NodeUnderMaintenance
    } else if snapshot.is_transferring || *status == InstanceStatus::Transferring {
        LifecycleView::Transferring
    } else if *status == InstanceStatus::RestoringBackup {
        LifecycleView::RestoringBackup
    } else {
        LifecycleView::PassThrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::InstanceSnapshot;
    use std::sync::Arc;

    fn state(status: InstanceStatus, transferring: bool, maintenance: bool) -> LifecycleState {
        let mut snapshot = InstanceSnapshot::new("srv-1", status);
        snapshot.is_transferring = transferring;
        snapshot.is_node_under_maintenance = maintenance;

        let mut state = LifecycleState::new("srv-1");
        state.snapshot = Some(Arc::new(snapshot));
        state
    }

    const FLAG_COMBINATIONS: [(bool, bool); 4] =
        [(false, false), (true, false), (false, true), (true, true)];

    #[test]
    fn test_installer_statuses_win_over_flags() {
        for status in [
            InstanceStatus::Installing,
            InstanceStatus::InstallFailed,
            InstanceStatus::ReinstallFailed,
        ] {
            for (transferring, maintenance) in FLAG_COMBINATIONS {
                let view = select_view(&state(status.clone(), transferring, maintenance));
                assert_eq!(view, LifecycleView::Installing);
            }
        }
    }

    #[test]
    fn test_suspended_wins_over_flags() {
        for (transferring, maintenance) in FLAG_COMBINATIONS {
            let view = select_view(&state(InstanceStatus::Suspended, transferring, maintenance));
            assert_eq!(view, LifecycleView::Suspended);
        }
    }

    #[test]
    fn test_maintenance_beats_transfer_and_restore() {
        let view = select_view(&state(InstanceStatus::RestoringBackup, true, true));
        assert_eq!(view, LifecycleView::NodeUnderMaintenance);
    }

    #[test]
    fn test_transfer_beats_restore() {
        let view = select_view(&state(InstanceStatus::RestoringBackup, true, false));
        assert_eq!(view, LifecycleView::Transferring);

        let view = select_view(&state(InstanceStatus::Transferring, false, false));
        assert_eq!(view, LifecycleView::Transferring);
    }

    #[test]
    fn test_restoring_backup_block() {
        let view = select_view(&state(InstanceStatus::RestoringBackup, false, false));
        assert_eq!(view, LifecycleView::RestoringBackup);
        assert_eq!(view.block().unwrap().image, Illustration::ServerRestore);
    }

    #[test]
    fn test_operational_statuses_pass_through() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Starting,
            InstanceStatus::Stopping,
            InstanceStatus::Offline,
        ] {
            let view = select_view(&state(status, false, false));
            assert_eq!(view, LifecycleView::PassThrough);
            assert!(view.block().is_none());
            assert!(!view.is_blocking());
        }
    }

    #[test]
    fn test_unknown_status_falls_through() {
        let unknown = InstanceStatus::from("defragmenting");
        assert_eq!(
            select_view(&state(unknown.clone(), false, false)),
            LifecycleView::PassThrough
        );
        assert_eq!(
            select_view(&state(unknown, false, true)),
            LifecycleView::NodeUnderMaintenance
        );
    }

    #[test]
    fn test_missing_snapshot_passes_through() {
        assert_eq!(
            select_view(&LifecycleState::new("srv-1")),
            LifecycleView::PassThrough
        );
    }

    #[test]
    fn test_every_blocking_view_has_distinct_title() {
        let views = [
            LifecycleView::Installing,
            LifecycleView::Suspended,
            LifecycleView::NodeUnderMaintenance,
            LifecycleView::Transferring,
            LifecycleView::RestoringBackup,
        ];
        let mut titles: Vec<&str> = views.iter().map(|v| v.block().unwrap().title).collect();
        titles.sort();
        titles.dedup();
        assert_eq!(titles.len(), views.len());
    }
}
