use std::sync::Arc;

use snaps_core::fsm::{Behaviors, FsmError, Interpreter, Machine, MachineConfig, Transition};
use snaps_core::{Snap, SnapStatus, StatusEvent};

pub(crate) type SnapMachine = Machine<SnapStatus, StatusEvent, Snap>;
pub(crate) type SnapInterpreter = Interpreter<SnapStatus, StatusEvent, Snap>;

const IS_ENABLED: &str = "isEnabled";
const PERSIST_STATUS: &str = "persistStatus";

fn transitions() -> Vec<Transition<SnapStatus, StatusEvent>> {
    use SnapStatus::*;
    use StatusEvent::*;

    let t = |from, event, to| Transition::new(from, event, to).action(PERSIST_STATUS);
    vec![
        t(Installing, Start, Running).guarded(IS_ENABLED),
        t(Updating, Start, Running).guarded(IS_ENABLED),
        t(Updating, Stop, Stopped),
        t(Running, Stop, Stopped),
        t(Running, Crash, Crashed),
        t(Stopped, Start, Running).guarded(IS_ENABLED),
        t(Stopped, Update, Updating),
        t(Crashed, Start, Running).guarded(IS_ENABLED),
        t(Crashed, Update, Updating),
    ]
}

/// The module lifecycle. Every transition writes the new status onto the record it runs against.
pub(crate) fn snap_machine() -> Result<Arc<SnapMachine>, FsmError> {
    let behaviors = Behaviors::new()
        .guard(IS_ENABLED, |snap: &Snap| snap.enabled)
        .action(PERSIST_STATUS, |snap: &mut Snap, status| snap.status = status);
    let machine = Machine::new(
        MachineConfig {
            id: "snap".to_string(),
            initial: SnapStatus::Installing,
            transitions: transitions(),
        },
        behaviors,
    )?;
    Ok(Arc::new(machine))
}
