use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{
    parse::Parse, parse::ParseStream, spanned::Spanned, Ident, ItemFn, ItemStruct, LitBool,
    LitStr, Result as SynResult, Token,
};

/// Registers a free function as a function rewrite in the process-wide registry.
///
/// ```ignore
/// #[register_rewriter(func_name = "tensor.add", backend = "tensorrt")]
/// fn add_as_sub(
///     ctx: &RewriteContext<'_, (Tensor, Tensor), Tensor>,
///     (x, y): (Tensor, Tensor),
/// ) -> anyhow::Result<Tensor> {
///     x.sub(&y)
/// }
/// ```
#[proc_macro_attribute]
pub fn register_rewriter(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand_register_rewriter(attr, item) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

/// Registers a wrapper type implementing `RewriteModule` as a module rewrite.
#[proc_macro_attribute]
pub fn register_rewrite_module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand_register_rewrite_module(attr, item) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

/// Registers a free function as a symbolic rewrite.
///
/// The first argument names the operator; `native = true` marks a native operator rather than a
/// user function path. `arg_descriptors` are checked here, at compile time.
#[proc_macro_attribute]
pub fn register_symbolic(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand_register_symbolic(attr, item) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

enum AttrValue {
    Str(LitStr),
    Bool(LitBool),
    List(Vec<LitStr>),
}

struct AttrEntry {
    key: Ident,
    value: AttrValue,
}

/// `"positional"?, key = "value" | key = true | key = ["a", "b"], ...`
struct RewriteAttr {
    positional: Option<LitStr>,
    entries: Vec<AttrEntry>,
}

impl Parse for RewriteAttr {
    fn parse(input: ParseStream<'_>) -> SynResult<Self> {
        let mut positional = None;
        if input.peek(LitStr) {
            positional = Some(input.parse::<LitStr>()?);
            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            }
        }

        let mut entries = Vec::new();
        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value = if input.peek(LitStr) {
                AttrValue::Str(input.parse()?)
            } else if input.peek(LitBool) {
                AttrValue::Bool(input.parse()?)
            } else if input.peek(syn::token::Bracket) {
                let content;
                syn::bracketed!(content in input);
                let items = content
                    .parse_terminated(<LitStr as Parse>::parse, Token![,])?
                    .into_iter()
                    .collect::<Vec<_>>();
                AttrValue::List(items)
            } else {
                return Err(input.error("expected a string, a bool or a list of strings"));
            };
            if entries.iter().any(|entry: &AttrEntry| entry.key == key) {
                return Err(syn::Error::new(key.span(), format!("duplicate argument `{key}`")));
            }
            entries.push(AttrEntry { key, value });

            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(RewriteAttr {
            positional,
            entries,
        })
    }
}

impl RewriteAttr {
    fn reject_unknown(&self, macro_name: &str, allowed: &[&str]) -> SynResult<()> {
        for entry in &self.entries {
            if !allowed.iter().any(|name| entry.key == name) {
                return Err(syn::Error::new(
                    entry.key.span(),
                    format!(
                        "unknown {macro_name} argument `{}` (expected one of: {})",
                        entry.key,
                        allowed.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }

    fn value(&self, key: &str) -> Option<&AttrEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    fn string(&self, key: &str) -> SynResult<Option<LitStr>> {
        match self.value(key) {
            None => Ok(None),
            Some(AttrEntry {
                value: AttrValue::Str(lit),
                ..
            }) => Ok(Some(lit.clone())),
            Some(entry) => Err(syn::Error::new(
                entry.key.span(),
                format!("`{key}` expects a string literal"),
            )),
        }
    }

    fn boolean(&self, key: &str) -> SynResult<Option<bool>> {
        match self.value(key) {
            None => Ok(None),
            Some(AttrEntry {
                value: AttrValue::Bool(lit),
                ..
            }) => Ok(Some(lit.value)),
            Some(entry) => Err(syn::Error::new(
                entry.key.span(),
                format!("`{key}` expects `true` or `false`"),
            )),
        }
    }

    fn list(&self, key: &str) -> SynResult<Option<Vec<LitStr>>> {
        match self.value(key) {
            None => Ok(None),
            Some(AttrEntry {
                value: AttrValue::List(items),
                ..
            }) => Ok(Some(items.clone())),
            Some(entry) => Err(syn::Error::new(
                entry.key.span(),
                format!("`{key}` expects a list of string literals"),
            )),
        }
    }

    /// Backend literal, `"default"` when omitted.
    fn backend(&self) -> SynResult<LitStr> {
        let backend = self
            .string("backend")?
            .unwrap_or_else(|| LitStr::new("default", Span::call_site()));
        if backend.value().trim().is_empty() {
            return Err(syn::Error::new(backend.span(), "backend must not be empty"));
        }
        Ok(backend)
    }
}

fn require_identity(lit: Option<LitStr>, message: &str) -> SynResult<LitStr> {
    let lit = lit.ok_or_else(|| syn::Error::new(Span::call_site(), message))?;
    if lit.value().trim().is_empty() {
        return Err(syn::Error::new(lit.span(), message));
    }
    Ok(lit)
}

fn require_free_fn(function: &ItemFn, macro_name: &str) -> SynResult<()> {
    if !function.sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            function.sig.generics.span(),
            format!("{macro_name} functions must not be generic"),
        ));
    }
    if let Some(receiver) = function.sig.receiver() {
        return Err(syn::Error::new(
            receiver.span(),
            format!("{macro_name} expects a free function"),
        ));
    }
    Ok(())
}

/// Lowercase identifier fragment built from arbitrary text.
fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Registrar function plus the link-time slice entry that runs it.
fn emit_registrar(stem: &str, body: TokenStream2) -> TokenStream2 {
    let register_ident = format_ident!("__rewrite_rs_register_{}", stem);
    let static_ident = format_ident!("__REWRITE_RS_REGISTRAR_{}", stem.to_uppercase());
    quote! {
        #[doc(hidden)]
        fn #register_ident(registry: &::rewrite_rs::registry::RewriteRegistry) {
            #body
        }

        #[::rewrite_rs::linkme::distributed_slice(::rewrite_rs::registry::REWRITE_REGISTRARS)]
        #[linkme(crate = ::rewrite_rs::linkme)]
        #[doc(hidden)]
        static #static_ident: fn(&::rewrite_rs::registry::RewriteRegistry) = #register_ident;
    }
}

fn expand_register_rewriter(attr: TokenStream, item: TokenStream) -> SynResult<TokenStream> {
    let attr: RewriteAttr = syn::parse(attr)?;
    let function: ItemFn = syn::parse(item)?;
    require_free_fn(&function, "register_rewriter")?;
    attr.reject_unknown("register_rewriter", &["func_name", "backend"])?;
    if let Some(positional) = &attr.positional {
        return Err(syn::Error::new(
            positional.span(),
            "register_rewriter takes `func_name = \"...\"`",
        ));
    }

    let func_name = require_identity(
        attr.string("func_name")?,
        "register_rewriter requires func_name = \"...\"",
    )?;
    let backend = attr.backend()?;
    let fn_ident = &function.sig.ident;

    let stem = format!(
        "fn_{}_{}_{}",
        sanitize(&fn_ident.to_string()),
        sanitize(&func_name.value()),
        sanitize(&backend.value())
    );
    let registrar = emit_registrar(
        &stem,
        quote! {
            registry.functions.register(#func_name, #backend, #fn_ident);
        },
    );

    Ok(quote! {
        #function
        #registrar
    }
    .into())
}

fn expand_register_rewrite_module(attr: TokenStream, item: TokenStream) -> SynResult<TokenStream> {
    let attr: RewriteAttr = syn::parse(attr)?;
    let wrapper: ItemStruct = syn::parse(item)?;
    if !wrapper.generics.params.is_empty() {
        return Err(syn::Error::new(
            wrapper.generics.span(),
            "register_rewrite_module wrappers must not be generic",
        ));
    }
    attr.reject_unknown("register_rewrite_module", &["module_type", "backend"])?;
    if let Some(positional) = &attr.positional {
        return Err(syn::Error::new(
            positional.span(),
            "register_rewrite_module takes `module_type = \"...\"`",
        ));
    }

    let module_type = require_identity(
        attr.string("module_type")?,
        "register_rewrite_module requires module_type = \"...\"",
    )?;
    let backend = attr.backend()?;
    let wrapper_ident = &wrapper.ident;

    let stem = format!(
        "module_{}_{}_{}",
        sanitize(&wrapper_ident.to_string()),
        sanitize(&module_type.value()),
        sanitize(&backend.value())
    );
    let registrar = emit_registrar(
        &stem,
        quote! {
            registry.modules.register::<#wrapper_ident>(#module_type, #backend);
        },
    );

    Ok(quote! {
        #wrapper
        #registrar
    }
    .into())
}

fn descriptor_variant(lit: &LitStr) -> SynResult<Ident> {
    let variant = match lit.value().as_str() {
        "v" => "Value",
        "i" => "Int",
        "f" => "Float",
        "b" => "Bool",
        "s" => "Str",
        "is" => "Ints",
        "fs" => "Floats",
        "none" => "None",
        other => {
            return Err(syn::Error::new(
                lit.span(),
                format!(
                    "unknown argument descriptor `{other}` \
                     (expected one of: v, i, f, b, s, is, fs, none)"
                ),
            ))
        }
    };
    Ok(Ident::new(variant, lit.span()))
}

fn expand_register_symbolic(attr: TokenStream, item: TokenStream) -> SynResult<TokenStream> {
    let attr: RewriteAttr = syn::parse(attr)?;
    let function: ItemFn = syn::parse(item)?;
    require_free_fn(&function, "register_symbolic")?;
    attr.reject_unknown("register_symbolic", &["backend", "native", "arg_descriptors"])?;

    let name = require_identity(
        attr.positional.clone(),
        "register_symbolic requires the operator name as its first argument",
    )?;
    let backend = attr.backend()?;
    let native = attr.boolean("native")?.unwrap_or(false);
    let descriptors = match attr.list("arg_descriptors")? {
        Some(items) => {
            let variants = items
                .iter()
                .map(descriptor_variant)
                .collect::<SynResult<Vec<_>>>()?;
            quote! {
                spec.arg_descriptors = ::std::option::Option::Some(::std::vec![
                    #(::rewrite_rs::symbolic::ArgDescriptor::#variants),*
                ]);
            }
        }
        None => TokenStream2::new(),
    };
    let fn_ident = &function.sig.ident;

    let stem = format!(
        "symbolic_{}_{}_{}_{}",
        sanitize(&fn_ident.to_string()),
        sanitize(&name.value()),
        if native { "native" } else { "function" },
        sanitize(&backend.value())
    );
    let registrar = emit_registrar(
        &stem,
        quote! {
            #[allow(unused_mut)]
            let mut spec = ::rewrite_rs::symbolic::SymbolicSpec::new(#name)
                .backend(#backend)
                .native(#native);
            #descriptors
            registry.symbolics.register(spec, #fn_ident);
        },
    );

    Ok(quote! {
        #function
        #registrar
    }
    .into())
}
