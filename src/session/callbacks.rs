use super::Session;
use crate::core::{EntityHandle, Result};
use crate::metadata::Callback;
use tracing::{Level, event};

impl Session {
    /// Runs the listeners bound to `callback` for the entity's type. The
    /// first error stops the chain and is returned to the caller; for the
    /// `Pre*` callbacks that aborts the operation before any I/O.
    pub(crate) fn fire(&self, handle: EntityHandle, callback: Callback) -> Result<()> {
        let instance = self.instance(handle)?;
        for name in instance.layout().listeners_for(callback) {
            match self.registry.listener(name) {
                Some(listener) => {
                    event!(
                        Level::TRACE,
                        entity = %handle,
                        listener = %name,
                        callback = ?callback,
                        "lifecycle callback"
                    );
                    listener.on_event(callback, &instance.view())?;
                }
                None => {
                    event!(
                        Level::WARN,
                        listener = %name,
                        callback = ?callback,
                        "no implementation bound for listener"
                    );
                }
            }
        }
        Ok(())
    }
}
