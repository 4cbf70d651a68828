//! Test attributes that run each test on a watchdog thread and fail it once a
//! wall-clock budget is spent.
//!
//! ```ignore
//! #[test_timeout::timeout]
//! fn sync_case() {}
//!
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn async_case() {}
//!
//! #[test_timeout::tokio_timeout_test(start_paused)]
//! async fn clock_case() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    start_paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            start_paused: false,
        };

        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                args.secs = secs;
            } else {
                let flag: Ident = input.parse()?;
                if flag == "start_paused" {
                    args.start_paused = true;
                } else {
                    return Err(syn::Error::new_spanned(
                        flag,
                        "expected a timeout in seconds or `start_paused`",
                    ));
                }
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(args)
    }
}

/// Async test on a fresh current-thread runtime.
///
/// With `start_paused` the runtime clock starts paused and auto-advances, so
/// only the wall-clock watchdog applies; an in-runtime timeout would itself be
/// fast-forwarded and fire before the timers under test.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_test_attributes(attrs);
    let secs = args.secs;

    let builder = if args.start_paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        }
    };

    let run = if args.start_paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_secs(#secs),
                    async move #block,
                )
                .await
                .expect("test timed out");
            });
        }
    };

    let body = quote! {
        let runtime = #builder.expect("failed to build Tokio runtime");
        #run
    };

    let watched = watchdog(secs, body);
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if args.start_paused {
        return syn::Error::new_spanned(
            &sig.ident,
            "`start_paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attributes(attrs);
    let watched = watchdog(args.secs, quote! { #block });
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    })
}

fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let watchdog_budget = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(watchdog_budget) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` so the expansion does not register
/// the function twice.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
