//! Plug-ins extend a component with behaviour installed after construction.
//!
//! A plug-in is bound to the one component it is installed on. It may use
//! the component's dispatch operations and ports, and it is finalised and
//! uninstalled when the component is finalised.
use crate::{component::Component, AnyResult};

pub trait Plugin: Send + Sync {
    /// Unique among the plug-ins of one component.
    fn uri(&self) -> &str;

    fn install(&self, owner: &Component) -> AnyResult<()>;

    /// Called while the owner is being finalised, before [`Plugin::uninstall`].
    fn finalise(&self, owner: &Component) -> AnyResult<()> {
        let _ = owner;
        Ok(())
    }

    fn uninstall(&self, owner: &Component) -> AnyResult<()> {
        let _ = owner;
        Ok(())
    }
}
