//! `#[tokio_timeout_test]`: runs an async test on a current-thread runtime
//! inside its own thread and fails it when it exceeds a wall-clock deadline.
//!
//! Accepted arguments, in any order: a deadline in seconds (default 30) and the
//! `paused` flag, which starts the runtime with tokio's clock paused so timer
//! driven code (handshake timeouts, backoff) runs instantly and
//! deterministically.
//!
//! ```ignore
//! #[tokio_timeout_test(5, paused)]
//! async fn evicts_after_timeout() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_DEADLINE_SECS: u64 = 30;

enum TestArg {
    Deadline(LitInt),
    Paused,
}

impl Parse for TestArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TestArg::Deadline(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TestArg::Paused)
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a deadline in seconds or `paused`",
            ))
        }
    }
}

struct TestArgs {
    deadline_secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            deadline_secs: DEFAULT_DEADLINE_SECS,
            paused: false,
        };
        for arg in Punctuated::<TestArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TestArg::Deadline(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "deadline must be positive"));
                    }
                    args.deadline_secs = secs;
                }
                TestArg::Paused => args.paused = true,
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TestArgs {
        deadline_secs,
        paused,
    } = parse_macro_input!(attr as TestArgs);

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

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let pause = if paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#deadline_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s deadline", #deadline_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
