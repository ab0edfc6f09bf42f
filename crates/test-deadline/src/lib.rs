//! Wall-clock deadlines for tests.
//!
//! A coordinator that stops ticking or a backend that never answers should
//! fail the suite quickly, not wedge it. `#[test_deadline::async_deadline]`
//! runs an async test on a fresh current-thread Tokio runtime inside a
//! watchdog thread; `#[test_deadline::deadline]` is the synchronous variant.
//! Both accept an optional deadline in seconds (`#[async_deadline(5)]`) and
//! default to 30 seconds.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn async_deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline_secs = match parse_deadline(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "async_deadline requires an async function; use #[test_deadline::deadline] instead",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_harness_attrs(attrs);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build test runtime");
        runtime.block_on(async move #block);
    };
    let harness = watchdog(deadline_secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

#[proc_macro_attribute]
pub fn deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline_secs = match parse_deadline(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "deadline expects a synchronous function; use #[test_deadline::async_deadline] instead",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_harness_attrs(attrs);
    let harness = watchdog(deadline_secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

fn parse_deadline(attr: TokenStream) -> Result<u64, syn::Error> {
    if attr.is_empty() {
        return Ok(DEFAULT_DEADLINE_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "deadline must be at least one second",
        ));
    }
    Ok(secs)
}

/// Runs `body` on a watchdog thread and panics in the test thread if it does
/// not report back within the deadline. Panics from the body are re-raised so
/// assertion messages survive the thread hop.
fn watchdog(deadline_secs: u64, body: proc_macro2::TokenStream) -> proc_macro2::TokenStream {
    quote! {
        let deadline = std::time::Duration::from_secs(#deadline_secs);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                #body
            }));
            let _ = done_tx.send(outcome);
        });
        match done_rx.recv_timeout(deadline) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s deadline", #deadline_secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting an outcome")
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` from the original function so the
/// generated wrapper is the only registered test.
fn strip_harness_attrs(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| !is_harness_attr(attr))
        .collect()
}

fn is_harness_attr(attr: &Attribute) -> bool {
    let idents: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(idents.as_slice(), [only] if only == "test")
        || matches!(idents.as_slice(), [first, second] if first == "tokio" && second == "test")
}
