//! Code generator for `wlkit-client`.
//!
//! **Do not use directly. Call `wlkit_client::generate!()` instead.**
//!
//! `generate!("path/to/protocol.xml")` expands to one module per interface
//! plus an `INTERFACES` descriptor slice. The path is resolved relative to
//! `CARGO_MANIFEST_DIR` and may also name a directory, in which case every
//! `*.xml` file inside is generated, each wrapped in a module named after
//! its protocol.

use std::ffi::CString;
use std::path::PathBuf;

use proc_macro2::{Literal, Span, TokenStream};
use proc_macro_crate::{crate_name, FoundCrate};
use quote::{format_ident, quote};
use wlkit_proto_parser::*;

mod utils;
use crate::utils::*;

/// Interfaces frozen at version 1: their event enums are exhaustive.
const FROZEN_IFACES: &[&str] = &["wl_callback", "wl_buffer"];

fn client_crate_path() -> TokenStream {
    match crate_name("wlkit-client") {
        Ok(FoundCrate::Name(name)) => {
            let ident = format_ident!("{}", name);
            quote! { ::#ident }
        }
        Ok(FoundCrate::Itself) => quote! { crate },
        _ => quote! { ::wlkit_client },
    }
}

#[doc(hidden)]
#[proc_macro]
pub fn generate(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let path = syn::parse_macro_input!(input as syn::LitStr).value();
    let path = match std::env::var_os("CARGO_MANIFEST_DIR") {
        Some(manifest) => {
            let mut full = PathBuf::from(manifest);
            full.push(path);
            full
        }
        None => PathBuf::from(path),
    };

    let client = client_crate_path();

    let out = if path.is_dir() {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
                .collect(),
            Err(err) => return compile_error(&format!("could not read {path:?}: {err}")),
        };
        files.sort();

        let mut modules = TokenStream::new();
        for file in &files {
            let protocol = match load_protocol(file) {
                Ok(protocol) => protocol,
                Err(err) => return compile_error(&err),
            };
            let mod_name = syn::Ident::new(&module_name(&protocol.name), Span::call_site());
            let body = gen_protocol(&protocol, &client);
            modules.extend(quote! {
                pub mod #mod_name {
                    #body
                }
            });
        }
        modules
    } else {
        match load_protocol(&path) {
            Ok(protocol) => gen_protocol(&protocol, &client),
            Err(err) => return compile_error(&err),
        }
    };

    out.into()
}

fn compile_error(msg: &str) -> proc_macro::TokenStream {
    quote!(compile_error!(#msg);).into()
}

fn load_protocol(path: &std::path::Path) -> Result<Protocol, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("could not read {path:?}: {err}"))?;
    parse_protocol(&text).map_err(|err| format!("error parsing {path:?}: {err}"))
}

fn gen_protocol(protocol: &Protocol, client: &TokenStream) -> TokenStream {
    let interfaces = protocol.interfaces.iter().map(|i| gen_interface(i, client));

    let descriptors = protocol.interfaces.iter().map(|i| {
        let proxy_name = make_pascal_case_ident(&i.name);
        quote! { <#proxy_name as #client::object::Proxy>::INTERFACE }
    });

    quote! {
        #(#interfaces)*

        /// Descriptors of every interface this protocol defines. Feed to
        /// `Connection::register_interfaces` so server-created objects of
        /// these types can be materialized.
        pub static INTERFACES: &[&'static #client::core::Interface] = &[ #(#descriptors,)* ];
    }
}

fn make_ident(name: impl AsRef<str>) -> syn::Ident {
    syn::Ident::new_raw(name.as_ref(), Span::call_site())
}

fn make_pascal_case_ident(name: impl AsRef<str>) -> syn::Ident {
    let name = name.as_ref();
    if name.chars().next().unwrap().is_ascii_digit() {
        syn::Ident::new_raw(&format!("_{name}"), Span::call_site())
    } else {
        syn::Ident::new_raw(&snake_to_pascal(name), Span::call_site())
    }
}

fn make_proxy_path(iface: impl AsRef<str>) -> TokenStream {
    let proxy_name = make_pascal_case_ident(iface);
    quote! { super::#proxy_name }
}

fn cstr_literal(s: &str) -> Literal {
    Literal::c_string(&CString::new(s).expect("interior NUL in interface name"))
}

/// One decoded value of an event payload.
struct EventField {
    ident: syn::Ident,
    ty: TokenStream,
    summary: Option<String>,
}

/// The fields an argument contributes to the event payload. An
/// interface-less `new_id` expands to (interface, version, id), everything
/// else is a single field.
fn event_fields(arg: &Argument) -> Vec<EventField> {
    let ident = make_ident(&arg.name);
    let summary = arg.summary.clone();
    let single = |ty: TokenStream| {
        vec![EventField {
            ident,
            ty,
            summary,
        }]
    };

    match &arg.arg_type {
        ArgType::Int => single(quote!(i32)),
        ArgType::Uint => single(quote!(u32)),
        ArgType::Enum(enum_ty) => single(enum_type_path(enum_ty)),
        ArgType::Fixed => single(quote!(_wk::core::Fixed)),
        ArgType::Object { allow_null, .. } => match allow_null {
            false => single(quote!(_wk::core::ObjectId)),
            true => single(quote!(::std::option::Option<_wk::core::ObjectId>)),
        },
        ArgType::NewId { iface: Some(iface) } => single(make_proxy_path(iface)),
        ArgType::NewId { iface: None } => vec![
            EventField {
                ident: make_ident(format!("{}_interface", arg.name)),
                ty: quote!(::std::ffi::CString),
                summary: None,
            },
            EventField {
                ident: make_ident(format!("{}_version", arg.name)),
                ty: quote!(u32),
                summary: None,
            },
            EventField {
                ident: make_ident(&arg.name),
                ty: quote!(_wk::core::ObjectId),
                summary: arg.summary.clone(),
            },
        ],
        ArgType::String { allow_null: false } => single(quote!(::std::ffi::CString)),
        ArgType::String { allow_null: true } => {
            single(quote!(::std::option::Option<::std::ffi::CString>))
        }
        ArgType::Array => single(quote!(::std::vec::Vec<u8>)),
        ArgType::Fd => single(quote!(::std::os::fd::OwnedFd)),
    }
}

fn enum_type_path(enum_ty: &str) -> TokenStream {
    if let Some((iface, name)) = enum_ty.split_once('.') {
        let iface_mod = syn::Ident::new(iface, Span::call_site());
        let enum_name = make_pascal_case_ident(name);
        quote!(super::#iface_mod::#enum_name)
    } else {
        let enum_name = make_pascal_case_ident(enum_ty);
        quote!(#enum_name)
    }
}

/// Pattern matching the argument's `ArgValue` plus the expressions that
/// turn the bound names into payload fields.
fn event_decode(arg: &Argument) -> (TokenStream, Vec<TokenStream>) {
    let name = make_ident(&arg.name);
    match &arg.arg_type {
        ArgType::Int => (quote!(_wk::core::ArgValue::Int(#name)), vec![quote!(#name)]),
        ArgType::Uint => (quote!(_wk::core::ArgValue::Uint(#name)), vec![quote!(#name)]),
        ArgType::Enum(_) => (
            quote!(_wk::core::ArgValue::Uint(#name)),
            vec![quote! {
                match #name.try_into() {
                    ::std::result::Result::Ok(val) => val,
                    ::std::result::Result::Err(_) => return ::std::result::Result::Err(_wk::object::BadMessage),
                }
            }],
        ),
        ArgType::Fixed => (
            quote!(_wk::core::ArgValue::Fixed(#name)),
            vec![quote!(#name)],
        ),
        ArgType::Object {
            allow_null: false, ..
        } => (
            quote!(_wk::core::ArgValue::Object(#name)),
            vec![quote!(#name)],
        ),
        ArgType::Object {
            allow_null: true, ..
        } => (
            quote!(_wk::core::ArgValue::OptObject(#name)),
            vec![quote!(#name)],
        ),
        ArgType::NewId { iface: Some(iface) } => {
            let proxy = make_proxy_path(iface);
            (
                quote!(_wk::core::ArgValue::NewId(#name)),
                vec![quote!(<#proxy as Proxy>::new(#name, __self_version))],
            )
        }
        ArgType::NewId { iface: None } => {
            let iface_field = make_ident(format!("{}_interface", arg.name));
            let version_field = make_ident(format!("{}_version", arg.name));
            (
                quote!(_wk::core::ArgValue::AnyNewId(#iface_field, #version_field, #name)),
                vec![
                    quote!(#iface_field.into_owned()),
                    quote!(#version_field),
                    quote!(#name),
                ],
            )
        }
        ArgType::String { allow_null: false } => (
            quote!(_wk::core::ArgValue::String(#name)),
            vec![quote!(#name)],
        ),
        ArgType::String { allow_null: true } => (
            quote!(_wk::core::ArgValue::OptString(#name)),
            vec![quote!(#name)],
        ),
        ArgType::Array => (
            quote!(_wk::core::ArgValue::Array(#name)),
            vec![quote!(#name)],
        ),
        ArgType::Fd => (quote!(_wk::core::ArgValue::Fd(#name)), vec![quote!(#name)]),
    }
}

fn gen_interface(iface: &Interface, client: &TokenStream) -> TokenStream {
    let mod_doc = gen_doc(iface.summary.as_deref(), None);
    let mod_name = syn::Ident::new(&iface.name, Span::call_site());

    let proxy_name = make_pascal_case_ident(&iface.name);
    let proxy_name_str = snake_to_pascal(&iface.name);

    let raw_iface_name = &iface.name;
    let iface_name_cstr = cstr_literal(&iface.name);
    let iface_version = iface.version;

    let gen_msg_desc = |msg: &Message| {
        let args = msg.args.iter().map(signature_arg_type);
        let name = &msg.name;
        let is_destructor = msg.is_destructor;
        quote! {
            _wk::core::MessageDesc {
                name: #name,
                is_destructor: #is_destructor,
                signature: &[ #( _wk::core::ArgType::#args, )* ],
            }
        }
    };
    let events_desc = iface.events.iter().map(gen_msg_desc);
    let requests_desc = iface.requests.iter().map(gen_msg_desc);

    let event_args_structs = iface.events.iter().filter_map(|event| {
        let fields: Vec<EventField> = event.args.iter().flat_map(event_fields).collect();
        if fields.len() < 2 {
            return None;
        }
        let struct_name = format_ident!("{}Args", make_pascal_case_ident(&event.name));
        let field_ident = fields.iter().map(|f| &f.ident);
        let field_ty = fields.iter().map(|f| &f.ty);
        let field_doc = fields
            .iter()
            .map(|f| f.summary.as_ref().map(|s| quote!(#[doc = #s])));
        Some(quote! {
            #[derive(Debug)]
            pub struct #struct_name { #( #field_doc pub #field_ident: #field_ty, )* }
        })
    });

    let event_enum_options = iface.events.iter().map(|event| {
        let event_name = make_pascal_case_ident(&event.name);
        let doc = gen_doc(event.summary.as_deref(), Some(event.since));
        let fields: Vec<EventField> = event.args.iter().flat_map(event_fields).collect();
        match fields.as_slice() {
            [] => quote! { #doc #event_name },
            [field] => {
                let ty = &field.ty;
                let summary = field
                    .summary
                    .as_ref()
                    .map(|s| quote!(#[doc = "\n"] #[doc = #s]));
                quote! { #doc #summary #event_name(#ty) }
            }
            _ => {
                let struct_name = format_ident!("{event_name}Args");
                quote! { #doc #event_name(#struct_name) }
            }
        }
    });

    let event_decoding = iface.events.iter().enumerate().map(|(opcode, event)| {
        let event_name = make_pascal_case_ident(&event.name);
        let opcode = opcode as u16;
        let args_len = event.args.len();

        let mut patterns = Vec::new();
        let mut field_exprs = Vec::new();
        let mut field_idents = Vec::new();
        for arg in &event.args {
            let (pattern, exprs) = event_decode(arg);
            patterns.push(pattern);
            for (field, expr) in event_fields(arg).iter().zip(exprs) {
                field_idents.push(field.ident.clone());
                field_exprs.push(expr);
            }
        }

        let retval = match field_idents.len() {
            0 => quote!(Event::#event_name),
            1 => {
                let expr = &field_exprs[0];
                quote!(Event::#event_name(#expr))
            }
            _ => {
                let struct_name = format_ident!("{event_name}Args");
                quote!(Event::#event_name(#struct_name {
                    #( #field_idents: #field_exprs, )*
                }))
            }
        };

        quote! {
            #opcode => {
                if __event.args.len() != #args_len {
                    return ::std::result::Result::Err(_wk::object::BadMessage);
                }
                let mut __args = __event.args.drain(..);
                #(
                    let ::std::option::Option::Some(#patterns) = __args.next()
                        else { return ::std::result::Result::Err(_wk::object::BadMessage) };
                )*
                drop(__args);
                __pool.reuse_args(__event.args);
                ::std::result::Result::Ok(#retval)
            }
        }
    });

    let event_handlers = iface
        .events
        .iter()
        .enumerate()
        .map(|(opcode, event)| gen_event_installer(opcode as u16, event));

    let requests = iface
        .requests
        .iter()
        .enumerate()
        .map(|(opcode, request)| gen_request_fn(opcode as u16, request));

    let enums = iface.enums.iter().map(gen_enum);

    let destructor = iface
        .requests
        .iter()
        .find(|r| r.is_destructor && r.args.is_empty())
        .map(|request| {
            let method = make_ident(&request.name);
            quote! {
                impl _wk::Destroy for #proxy_name {
                    fn send_destructor<D>(
                        self,
                        conn: &mut _wk::Connection<D>,
                    ) -> ::std::result::Result<(), _wk::UsageError> {
                        self.#method(conn)
                    }
                }
            }
        });

    let visibility = if iface.name == "wl_display" {
        quote!(pub(crate))
    } else {
        quote!(pub)
    };

    let extra_impl = (iface.name == "wl_display").then(|| {
        quote! {
            impl WlDisplay {
                pub const INSTANCE: Self = Self {
                    id: _wk::core::ObjectId::DISPLAY,
                    version: 1,
                };
            }
        }
    });

    let event_exhaustiveness =
        (!FROZEN_IFACES.contains(&iface.name.as_str())).then(|| quote! { #[non_exhaustive] });

    // Interfaces without events never touch the message in parse_event.
    let event_param = if iface.events.is_empty() {
        quote!(__event)
    } else {
        quote!(mut __event)
    };

    quote! {
        #mod_doc
        #visibility mod #mod_name {
            #![allow(clippy::empty_docs)]

            use #client as _wk;
            use _wk::object::Proxy;

            #mod_doc
            #[doc = "See [`Event`] for the list of possible events."]
            #[derive(Clone, Copy)]
            pub struct #proxy_name {
                id: _wk::core::ObjectId,
                version: u32,
            }

            #extra_impl

            impl Proxy for #proxy_name {
                type Event = Event;

                const INTERFACE: &'static _wk::core::Interface = &_wk::core::Interface {
                    name: #iface_name_cstr,
                    version: #iface_version,
                    requests: &[ #(#requests_desc,)* ],
                    events: &[ #(#events_desc,)* ],
                };

                fn new(id: _wk::core::ObjectId, version: u32) -> Self {
                    Self { id, version }
                }

                fn parse_event(
                    #event_param: _wk::core::Message,
                    __self_version: u32,
                    __pool: &mut _wk::core::MessageBuffersPool,
                ) -> ::std::result::Result<Event, _wk::object::BadMessage> {
                    match __event.header.opcode {
                        #( #event_decoding )*
                        _ => ::std::result::Result::Err(_wk::object::BadMessage),
                    }
                }

                fn id(&self) -> _wk::core::ObjectId {
                    self.id
                }

                fn version(&self) -> u32 {
                    self.version
                }
            }

            impl TryFrom<_wk::object::Object> for #proxy_name {
                type Error = _wk::object::WrongObject;

                fn try_from(
                    object: _wk::object::Object,
                ) -> ::std::result::Result<Self, _wk::object::WrongObject> {
                    if object.interface == Self::INTERFACE {
                        ::std::result::Result::Ok(Self {
                            id: object.id,
                            version: object.version,
                        })
                    } else {
                        ::std::result::Result::Err(_wk::object::WrongObject)
                    }
                }
            }

            impl ::std::fmt::Debug for #proxy_name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "{}@{}v{}", #raw_iface_name, self.id.as_u32(), self.version)
                }
            }

            impl ::std::cmp::PartialEq for #proxy_name {
                #[inline]
                fn eq(&self, other: &Self) -> bool {
                    self.id == other.id
                }
            }

            impl ::std::cmp::Eq for #proxy_name {}

            impl ::std::cmp::PartialOrd for #proxy_name {
                #[inline]
                fn partial_cmp(&self, other: &Self) -> ::std::option::Option<::std::cmp::Ordering> {
                    ::std::option::Option::Some(::std::cmp::Ord::cmp(self, other))
                }
            }

            impl ::std::cmp::Ord for #proxy_name {
                #[inline]
                fn cmp(&self, other: &Self) -> ::std::cmp::Ordering {
                    self.id.cmp(&other.id)
                }
            }

            impl ::std::hash::Hash for #proxy_name {
                #[inline]
                fn hash<H: ::std::hash::Hasher>(&self, state: &mut H) {
                    self.id.hash(state);
                }
            }

            impl ::std::borrow::Borrow<_wk::core::ObjectId> for #proxy_name {
                #[inline]
                fn borrow(&self) -> &_wk::core::ObjectId {
                    &self.id
                }
            }

            #( #event_args_structs )*
            #( #enums )*

            #[doc = "The event enum for [`"]
            #[doc = #proxy_name_str]
            #[doc = "`]"]
            #[derive(Debug)]
            #event_exhaustiveness
            pub enum Event {
                #( #event_enum_options, )*
            }

            impl #proxy_name {
                #( #requests )*
                #( #event_handlers )*
            }

            #destructor
        }

        #visibility use #mod_name::#proxy_name;
    }
}

fn gen_event_installer(opcode: u16, event: &Message) -> TokenStream {
    let event_variant = make_pascal_case_ident(&event.name);
    let fn_name = syn::Ident::new_raw(&format!("on_{}", event.name), Span::call_site());
    let fields: Vec<EventField> = event.args.iter().flat_map(event_fields).collect();

    let (payload_ty, extract_arm) = match fields.as_slice() {
        [] => (
            quote!(()),
            quote!(Event::#event_variant => ::std::option::Option::Some(())),
        ),
        [field] => {
            let ty = &field.ty;
            (
                quote!(#ty),
                quote!(Event::#event_variant(payload) => ::std::option::Option::Some(payload)),
            )
        }
        _ => {
            let struct_name = format_ident!("{event_variant}Args");
            (
                quote!(#struct_name),
                quote!(Event::#event_variant(payload) => ::std::option::Option::Some(payload)),
            )
        }
    };

    let doc_summary = format!(
        "Install a handler for the `{}` event, returning the previous one.\n",
        event.name
    );
    let doc_contract = "The handler keeps its slot by returning `Ok(true)`; `Ok(false)` \
                        uninstalls it and an error uninstalls it and is logged.\n";

    quote! {
        #[doc = #doc_summary]
        #[doc = "\n"]
        #[doc = #doc_contract]
        pub fn #fn_name<D, F>(
            self,
            conn: &mut _wk::Connection<D>,
            cb: F,
        ) -> ::std::result::Result<::std::option::Option<_wk::RawHandler<D>>, _wk::UsageError>
        where
            F: FnMut(_wk::EventCtx<'_, D, Self>, #payload_ty) -> _wk::HandlerResult
                + ::std::marker::Send
                + 'static,
        {
            conn.install_handler(
                self,
                #opcode,
                |event: Event| match event {
                    #extract_arm,
                    #[allow(unreachable_patterns)]
                    _ => ::std::option::Option::None,
                },
                cb,
            )
        }
    }
}

fn gen_request_fn(opcode: u16, request: &Message) -> TokenStream {
    assert!(
        request
            .args
            .iter()
            .filter(|x| matches!(x.arg_type, ArgType::NewId { .. }))
            .count()
            <= 1,
        "{} has more than one new_id argument",
        request.name,
    );

    let new_id_interface = request.args.iter().find_map(|x| match &x.arg_type {
        ArgType::NewId { iface } => Some(iface.as_deref()),
        _ => None,
    });

    let mut fn_args = vec![quote!(self), quote!(conn: &mut _wk::Connection<D>)];
    fn_args.extend(request.args.iter().flat_map(request_fn_arg));

    let msg_args = request.args.iter().map(|arg| {
        let arg_name = make_ident(&arg.name);
        match &arg.arg_type {
            ArgType::Int => quote!(_wk::core::ArgValue::Int(#arg_name)),
            ArgType::Uint => quote!(_wk::core::ArgValue::Uint(#arg_name)),
            ArgType::Enum(_) => quote!(_wk::core::ArgValue::Uint(#arg_name.into())),
            ArgType::Fixed => quote!(_wk::core::ArgValue::Fixed(#arg_name)),
            ArgType::NewId { iface: Some(_) } => {
                quote!(_wk::core::ArgValue::NewId(Proxy::id(&new_object)))
            }
            ArgType::NewId { iface: None } => quote! {
                _wk::core::ArgValue::AnyNewId(
                    ::std::borrow::Cow::Borrowed(P::INTERFACE.name),
                    Proxy::version(&new_object),
                    Proxy::id(&new_object),
                )
            },
            ArgType::Object {
                allow_null, iface, ..
            } => match (allow_null, iface.is_some()) {
                (false, true) => quote!(_wk::core::ArgValue::Object(Proxy::id(&#arg_name))),
                (false, false) => quote!(_wk::core::ArgValue::Object(#arg_name.id)),
                (true, true) => {
                    quote!(_wk::core::ArgValue::OptObject(#arg_name.as_ref().map(Proxy::id)))
                }
                (true, false) => {
                    quote!(_wk::core::ArgValue::OptObject(#arg_name.map(|obj| obj.id)))
                }
            },
            ArgType::String { allow_null: false } => {
                quote!(_wk::core::ArgValue::String(#arg_name))
            }
            ArgType::String { allow_null: true } => {
                quote!(_wk::core::ArgValue::OptString(#arg_name))
            }
            ArgType::Array => quote!(_wk::core::ArgValue::Array(#arg_name)),
            ArgType::Fd => quote!(_wk::core::ArgValue::Fd(#arg_name)),
        }
    });

    let send_message = quote! {
        let mut _args_vec = conn.alloc_msg_args();
        #( _args_vec.push(#msg_args); )*
        conn.send_request(
            Self::INTERFACE,
            _wk::core::Message {
                header: _wk::core::MessageHeader {
                    object_id: self.id,
                    size: 0,
                    opcode: #opcode,
                },
                args: _args_vec,
            },
        )
    };

    let doc = gen_doc(request.summary.as_deref(), Some(request.since));
    let fn_name = make_ident(&request.name);

    match new_id_interface {
        // No object is created: submit and report the outcome.
        None => quote! {
            #doc
            #[allow(clippy::too_many_arguments)]
            pub fn #fn_name<D>(#(#fn_args),*) -> ::std::result::Result<(), _wk::UsageError> {
                #send_message
            }
        },
        // Interface-less new_id: the caller picks the proxy type and version.
        Some(None) => quote! {
            #doc
            #[allow(clippy::too_many_arguments)]
            pub fn #fn_name<P: Proxy, D>(#(#fn_args),*) -> ::std::result::Result<P, _wk::UsageError> {
                let new_object = conn.allocate_new_object::<P>(version);
                match { #send_message } {
                    ::std::result::Result::Ok(()) => ::std::result::Result::Ok(new_object),
                    ::std::result::Result::Err(err) => {
                        conn.cancel_new_object(Proxy::id(&new_object));
                        ::std::result::Result::Err(err)
                    }
                }
            }
        },
        // Typed new_id: the created proxy inherits this object's version.
        Some(Some(created)) => {
            let proxy_path = make_proxy_path(created);
            quote! {
                #doc
                #[allow(clippy::too_many_arguments)]
                pub fn #fn_name<D>(#(#fn_args),*) -> ::std::result::Result<#proxy_path, _wk::UsageError> {
                    let new_object = conn.allocate_new_object::<#proxy_path>(self.version);
                    match { #send_message } {
                        ::std::result::Result::Ok(()) => ::std::result::Result::Ok(new_object),
                        ::std::result::Result::Err(err) => {
                            conn.cancel_new_object(Proxy::id(&new_object));
                            ::std::result::Result::Err(err)
                        }
                    }
                }
            }
        }
    }
}

/// The function parameter an argument contributes, if any. A typed `new_id`
/// is the return value instead; an untyped one takes only a version.
fn request_fn_arg(arg: &Argument) -> Option<TokenStream> {
    let arg_name = make_ident(&arg.name);
    let tokens = match &arg.arg_type {
        ArgType::Int => quote!(#arg_name: i32),
        ArgType::Uint => quote!(#arg_name: u32),
        ArgType::Enum(enum_ty) => {
            let path = enum_type_path(enum_ty);
            quote!(#arg_name: #path)
        }
        ArgType::Fixed => quote!(#arg_name: _wk::core::Fixed),
        ArgType::Object {
            allow_null,
            iface: None,
        } => match allow_null {
            false => quote!(#arg_name: _wk::object::Object),
            true => quote!(#arg_name: ::std::option::Option<_wk::object::Object>),
        },
        ArgType::Object {
            allow_null,
            iface: Some(iface),
        } => {
            let proxy_path = make_proxy_path(iface);
            match allow_null {
                false => quote!(#arg_name: #proxy_path),
                true => quote!(#arg_name: ::std::option::Option<#proxy_path>),
            }
        }
        ArgType::NewId { iface: None } => quote!(version: u32),
        ArgType::NewId { iface: Some(_) } => return None,
        ArgType::String { allow_null: false } => quote!(#arg_name: ::std::ffi::CString),
        ArgType::String { allow_null: true } => {
            quote!(#arg_name: ::std::option::Option<::std::ffi::CString>)
        }
        ArgType::Array => quote!(#arg_name: ::std::vec::Vec<u8>),
        ArgType::Fd => quote!(#arg_name: ::std::os::fd::OwnedFd),
    };
    Some(tokens)
}

/// The `ArgType` variant used in the static signature.
fn signature_arg_type(arg: &Argument) -> TokenStream {
    match &arg.arg_type {
        ArgType::Int => quote!(Int),
        ArgType::Uint | ArgType::Enum(_) => quote!(Uint),
        ArgType::Fixed => quote!(Fixed),
        ArgType::Object {
            allow_null: false, ..
        } => quote!(Object),
        ArgType::Object {
            allow_null: true, ..
        } => quote!(OptObject),
        ArgType::NewId { iface: Some(iface) } => {
            let proxy_path = make_proxy_path(iface);
            quote!(NewId(#proxy_path::INTERFACE))
        }
        ArgType::NewId { iface: None } => quote!(AnyNewId),
        ArgType::String { allow_null: false } => quote!(String),
        ArgType::String { allow_null: true } => quote!(OptString),
        ArgType::Array => quote!(Array),
        ArgType::Fd => quote!(Fd),
    }
}

fn gen_enum(en: &Enum) -> TokenStream {
    let name = make_pascal_case_ident(&en.name);
    let doc = gen_doc(en.summary.as_deref(), None);
    let items: Vec<_> = en
        .items
        .iter()
        .map(|item| make_pascal_case_ident(&item.name))
        .collect();
    let values: Vec<_> = en.items.iter().map(|item| item.value).collect();
    let item_docs: Vec<_> = en
        .items
        .iter()
        .map(|i| gen_doc(i.summary.as_deref(), Some(i.since)))
        .collect();

    if en.is_bitfield {
        quote! {
            #doc
            #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
            pub struct #name(u32);

            impl From<#name> for u32 {
                fn from(val: #name) -> u32 {
                    val.0
                }
            }

            impl From<u32> for #name {
                fn from(val: u32) -> Self {
                    Self(val)
                }
            }

            impl #name {
                #(
                    #item_docs
                    #[allow(non_upper_case_globals)]
                    pub const #items: Self = Self(#values);
                )*

                pub fn empty() -> Self {
                    Self(0)
                }

                pub fn contains(self, item: Self) -> bool {
                    self.0 & item.0 == item.0
                }
            }

            impl ::std::ops::BitOr for #name {
                type Output = Self;
                fn bitor(self, rhs: Self) -> Self {
                    Self(self.0 | rhs.0)
                }
            }

            impl ::std::ops::BitOrAssign for #name {
                fn bitor_assign(&mut self, rhs: Self) {
                    self.0 |= rhs.0;
                }
            }
        }
    } else {
        quote! {
            #doc
            #[repr(u32)]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            #[non_exhaustive]
            pub enum #name { #( #item_docs #items = #values, )* }

            impl From<#name> for u32 {
                fn from(val: #name) -> u32 {
                    val as u32
                }
            }

            impl TryFrom<u32> for #name {
                type Error = ();
                fn try_from(val: u32) -> ::std::result::Result<Self, ()> {
                    match val {
                        #( #values => ::std::result::Result::Ok(Self::#items), )*
                        _ => ::std::result::Result::Err(()),
                    }
                }
            }
        }
    }
}

fn gen_doc(summary: Option<&str>, since: Option<u32>) -> TokenStream {
    let summary = summary
        .map(|s| format!("{}\n", s.trim()))
        .map(|s| quote!(#[doc = #s]));

    let since = since
        .filter(|version| *version > 1)
        .map(|version| format!("**Since version {version}**.\n"))
        .map(|s| quote!(#[doc = #s]));

    quote! {
        #summary
        #[doc = "\n"]
        #since
    }
}
