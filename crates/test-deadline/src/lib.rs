//! Attribute macros that wrap tests in a watchdog thread so a wedged test
//! fails with "deadline exceeded" instead of hanging the whole suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 30;

/// `#[test_deadline::deadline]` or `#[test_deadline::deadline(10)]` on a
/// synchronous test function.
#[proc_macro_attribute]
pub fn deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_deadline_secs(attr) {
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
            "deadline expects a synchronous test; use tokio_deadline for async tests",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attrs(attrs);
    let body = quote! { #block };
    let harness = watchdog_harness(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

/// `#[test_deadline::tokio_deadline]` on an async test function. Builds a
/// current-thread tokio runtime inside the watchdog thread and races the
/// body against the same deadline.
#[proc_macro_attribute]
pub fn tokio_deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_deadline_secs(attr) {
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
            "tokio_deadline expects an async test; use deadline for synchronous tests",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_test_attrs(attrs);
    let body = quote! {
        {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_secs(#secs),
                    async move #block,
                )
                .await
                .expect("test deadline exceeded");
            });
        }
    };
    let harness = watchdog_harness(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #harness
        }
    })
}

fn parse_deadline_secs(attr: TokenStream) -> Result<u64, syn::Error> {
    if attr.is_empty() {
        return Ok(DEFAULT_DEADLINE_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "deadline must be non-zero"));
    }
    Ok(secs)
}

/// Runs `body` on a watchdog thread and panics if it neither finishes nor
/// panics within the deadline. Panics from the body are re-raised intact.
fn watchdog_harness(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let deadline = std::time::Duration::from_secs(#secs);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
            let _ = done_tx.send(outcome);
        });
        match done_rx.recv_timeout(deadline) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test deadline of {}s exceeded", #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting an outcome")
            }
        }
    }
}

/// Drops `#[test]` / `#[tokio::test]` so the expansion controls the harness.
fn strip_test_attrs(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path = attr.path();
            !(path.is_ident("test")
                || path
                    .segments
                    .iter()
                    .map(|segment| segment.ident.to_string())
                    .collect::<Vec<_>>()
                    == ["tokio", "test"])
        })
        .collect()
}
