//! Registry globals and typed binding.

use std::ffi::{CStr, CString};

use wlkit_core::{ArgValue, ObjectId};

use crate::connection::{Connection, RawHandler, UsageError};
use crate::object::{Object, Proxy};

/// One entry of the compositor's global registry.
///
/// Added by `wl_registry.global`, removed by `global_remove` (which also
/// detaches a bound proxy).
#[derive(Debug)]
pub struct Global {
    /// Numeric name assigned by the compositor.
    pub name: u32,
    pub interface: CString,
    /// Version advertised by the compositor.
    pub version: u32,
    pub(crate) bound: Option<ObjectId>,
}

impl Global {
    pub fn is<P: Proxy>(&self) -> bool {
        P::INTERFACE.name == self.interface.as_c_str()
    }

    /// The proxy bound to this global, if any.
    pub fn bound_id(&self) -> Option<ObjectId> {
        self.bound
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("no global provides interface {0:?}")]
    GlobalNotFound(&'static CStr),
    #[error("{count} globals provide interface {interface:?}, expected exactly one")]
    NotSingleton {
        interface: &'static CStr,
        count: usize,
    },
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl<D> Connection<D> {
    /// Bind the single global providing `P`'s interface.
    ///
    /// The bind version is `min(P::INTERFACE.version, advertised)`. The
    /// proxy is cached on the registry entry, so repeated calls return the
    /// same object. Fails if no global, or more than one, provides the
    /// interface; use [`get_globals`](Self::get_globals) for multi-instance
    /// interfaces like `wl_output`.
    pub fn get_global<P: Proxy>(&mut self) -> Result<P, BindError> {
        let mut bound = self.bind_matching::<P>()?;
        match bound.len() {
            1 => Ok(bound.pop().unwrap()),
            0 => Err(BindError::GlobalNotFound(P::INTERFACE.name)),
            count => Err(BindError::NotSingleton {
                interface: P::INTERFACE.name,
                count,
            }),
        }
    }

    /// Bind every global providing `P`'s interface. The result may be
    /// empty.
    pub fn get_globals<P: Proxy>(&mut self) -> Result<Vec<P>, BindError> {
        self.bind_matching()
    }

    fn bind_matching<P: Proxy>(&mut self) -> Result<Vec<P>, BindError> {
        let matching: Vec<(usize, u32, u32)> = self
            .globals
            .iter()
            .enumerate()
            .filter(|(_, global)| global.is::<P>())
            .map(|(index, global)| {
                (
                    index,
                    global.name,
                    u32::min(P::INTERFACE.version, global.version),
                )
            })
            .collect();

        let registry = self.registry();
        let mut proxies = Vec::with_capacity(matching.len());

        for (index, name, version) in matching {
            if let Some(id) = self.globals[index].bound {
                let version = self
                    .object_mgr
                    .get_object(id)
                    .map(|state| state.object.version)
                    .unwrap_or(version);
                proxies.push(P::new(id, version));
                continue;
            }

            let proxy: P = registry.bind(self, name, version).map_err(BindError::Usage)?;
            self.auto_setup(proxy.into());
            self.globals[index].bound = Some(proxy.id());
            proxies.push(proxy);
        }

        Ok(proxies)
    }

    /// Interface-specific handlers installed on freshly bound globals,
    /// keyed by interface name so extension protocols are covered without
    /// depending on their generated types.
    fn auto_setup(&mut self, object: Object) {
        match object.interface.name.to_bytes() {
            // The window manager pings to detect unresponsive clients;
            // answer on the dynamic call path.
            b"xdg_wm_base" => {
                let pong: RawHandler<D> = Box::new(|conn, _state, object, event| {
                    let Some(ArgValue::Uint(serial)) = event.args.first() else {
                        return Err("ping without a serial".into());
                    };
                    conn.call_by_name(object, "pong", vec![ArgValue::Uint(*serial)])?;
                    Ok(true)
                });
                let _ = self.on_raw(object, "ping", pong);
            }
            // Accumulate advertised pixel formats.
            b"wl_shm" => {
                let formats: RawHandler<D> = Box::new(|conn, _state, _object, event| {
                    if let Some(ArgValue::Uint(format)) = event.args.first() {
                        if !conn.shm_formats.contains(format) {
                            conn.shm_formats.push(*format);
                        }
                    }
                    Ok(true)
                });
                let _ = self.on_raw(object, "format", formats);
            }
            _ => (),
        }
    }
}
