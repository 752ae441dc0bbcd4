use super::descriptor::Callback;
use crate::core::Result;
use crate::entity::EntityView;

/// Receives life-cycle callbacks for the types that name it.
///
/// Returning an error from a `Pre*` callback aborts the operation that
/// triggered it; errors from `Post*` callbacks propagate to the caller after
/// the statement has already run.
pub trait EntityListener: Send + Sync {
    fn on_event(&self, callback: Callback, entity: &EntityView<'_>) -> Result<()>;
}

impl<F> EntityListener for F
where
    F: Fn(Callback, &EntityView<'_>) -> Result<()> + Send + Sync,
{
    fn on_event(&self, callback: Callback, entity: &EntityView<'_>) -> Result<()> {
        self(callback, entity)
    }
}
