//! Generated bindings for Wayland extension protocols.
//!
//! Every protocol sits behind a feature gate and none are enabled by
//! default. Modules re-export one typed proxy per interface plus an
//! `INTERFACES` slice for `Connection::register_interfaces`.

#![cfg_attr(docsrs, feature(doc_cfg))]

macro_rules! gen {
    (mod: $mod:ident, feat: $feat:literal, file: $file:literal, deps: [$($dep:ident),*],) => {
        #[cfg(feature = $feat)]
        #[cfg_attr(docsrs, doc(cfg(feature = $feat)))]
        pub mod $mod {
            $(gen!(@dep $dep);)*
            wlkit_client::generate!($file);
        }
    };
    (@dep core) => {
        #[allow(unused_imports)]
        use wlkit_client::protocol::*;
    };
    (@dep $dep:ident) => {
        #[allow(unused_imports)]
        use super::$dep::*;
    };
}

gen! {
    mod: xdg_shell,
    feat: "xdg-shell",
    file: "protocols/xdg-shell.xml",
    deps: [core],
}

gen! {
    mod: wlr_layer_shell_unstable_v1,
    feat: "wlr-layer-shell-unstable-v1",
    file: "protocols/wlr-layer-shell-unstable-v1.xml",
    deps: [core, xdg_shell],
}
