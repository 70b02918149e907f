//! Scope-bound destructor guard.

use std::ops::{Deref, DerefMut};

use crate::connection::{Connection, UsageError};
use crate::object::Proxy;

/// Implemented by generated proxies whose interface declares a destructor
/// request.
pub trait Destroy: Proxy {
    /// Queue the interface's destructor request. The id is recycled only
    /// once the compositor acknowledges with `delete_id`.
    fn send_destructor<D>(self, conn: &mut Connection<D>) -> Result<(), UsageError>;
}

/// Sends the proxy's destructor request when the scope ends.
///
/// ```no_run
/// # use wlkit_client::{Connection, Scoped};
/// # use wlkit_client::protocol::*;
/// # fn f(conn: &mut Connection<()>, compositor: WlCompositor) -> Result<(), Box<dyn std::error::Error>> {
/// let region = compositor.create_region(conn)?;
/// let mut region = Scoped::new(conn, region);
/// let r = *region;
/// r.add(region.conn(), 0, 0, 16, 16)?;
/// // dropping the guard queues wl_region.destroy
/// # Ok(())
/// # }
/// ```
///
/// Manual destruction stays available: take the proxy back with
/// [`into_inner`](Self::into_inner) and call its destructor method.
pub struct Scoped<'c, D, P: Destroy> {
    conn: &'c mut Connection<D>,
    proxy: Option<P>,
}

impl<'c, D, P: Destroy> Scoped<'c, D, P> {
    pub fn new(conn: &'c mut Connection<D>, proxy: P) -> Self {
        Self {
            conn,
            proxy: Some(proxy),
        }
    }

    /// The borrowed connection, for issuing further requests within the
    /// scope.
    pub fn conn(&mut self) -> &mut Connection<D> {
        self.conn
    }

    /// Dissolve the guard without destroying the object.
    pub fn into_inner(mut self) -> P {
        self.proxy.take().unwrap()
    }
}

impl<D, P: Destroy> Deref for Scoped<'_, D, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.proxy.as_ref().unwrap()
    }
}

impl<D, P: Destroy> DerefMut for Scoped<'_, D, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.proxy.as_mut().unwrap()
    }
}

impl<D, P: Destroy> Drop for Scoped<'_, D, P> {
    fn drop(&mut self) {
        if let Some(proxy) = self.proxy.take() {
            // The object may already be gone (terminated connection,
            // removed global); that is fine for a scope exit.
            let _ = proxy.send_destructor(self.conn);
        }
    }
}
