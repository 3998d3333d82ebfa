// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Provokes one fault category with every crashguard hook installed.
//!
//! Usage: `crashguard-demo [1-5]`. Without a valid selection the demo asks for one on stdin.

use anyhow::Context;
use libdd_crashguard::{
    self as crashguard, checked_copy, last_resort, runtime, CrashguardConfiguration, Dispatch,
    Disposition, FaultContext, GuardedAllocator, LifecyclePhase,
};
use std::io::{BufRead, Write};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOCATOR: GuardedAllocator = GuardedAllocator::system();

const MENU: &str = "\
Select the fault to provoke:
  1) abstract dispatch misuse
  2) uncaught error
  3) invalid argument
  4) allocation failure
  5) structured fault
";

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let selection = match std::env::args().nth(1).and_then(|arg| parse_selection(&arg)) {
        Some(selection) => selection,
        None => match prompt()? {
            Some(selection) => selection,
            None => {
                eprintln!("Invalid selection");
                std::process::exit(1);
            }
        },
    };

    // Lets the lifecycle demo resume after the misuse it provokes on purpose.
    runtime::set_purecall_handler("demo-resume", |ctx, next| {
        if let FaultContext::AbstractDispatchMisuse(info) = ctx {
            if matches!(
                info.phase,
                Some(LifecyclePhase::Constructing | LifecyclePhase::Destructing)
            ) {
                println!("demo: resuming after misuse while {:?}", info.phase);
                return Disposition::Continue;
            }
        }
        next.map_or_else(|| last_resort(ctx.kind()), |n| n.invoke(ctx))
    });

    let guard = crashguard::init(CrashguardConfiguration::default())?;
    guard.install_all()?;
    info!(selection, "provoking fault");

    match selection {
        1 => abstract_dispatch_misuse(),
        2 => panic!("demo: error escaping main"),
        3 => invalid_argument(),
        4 => allocation_failure(),
        _ => structured_fault(),
    }
}

fn parse_selection(input: &str) -> Option<u8> {
    input.trim().parse().ok().filter(|n| (1..=5).contains(n))
}

fn prompt() -> anyhow::Result<Option<u8>> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{MENU}> ")?;
    stdout.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(parse_selection(&line))
}

struct Widget {
    render: Dispatch<fn() -> &'static str>,
}

impl Widget {
    fn new() -> Self {
        let render: Dispatch<fn() -> &'static str> = Dispatch::new("Widget", "render");
        // Called before any implementation is bound.
        render.invoke(|f| f());
        Self { render }
    }
}

impl Drop for Widget {
    fn drop(&mut self) {
        self.render.begin_destruction();
        render_once(&self.render);
    }
}

fn render_once(render: &Dispatch<fn() -> &'static str>) {
    if let Some(text) = render.invoke(|f| f()) {
        println!("{text}");
    }
}

fn abstract_dispatch_misuse() -> anyhow::Result<()> {
    {
        let mut widget = Widget::new();
        widget.render.bind(|| "demo: widget rendered")?;
        widget.render.go_live()?;
        render_once(&widget.render);
    }

    // Live but never bound: nothing lets this one resume.
    let mut unbound: Dispatch<fn() -> &'static str> = Dispatch::new("Gadget", "render");
    unbound.go_live()?;
    render_once(&unbound);
    Ok(())
}

fn invalid_argument() -> anyhow::Result<()> {
    let src = b"payload";
    let copied = checked_copy(None, Some(src))?;
    println!("demo: copied {copied} bytes");
    Ok(())
}

fn allocation_failure() -> anyhow::Result<()> {
    let mut size: usize = 1 << 30;
    loop {
        let mut buffer: Vec<u8> = Vec::new();
        match buffer.try_reserve_exact(size) {
            Ok(()) => debug!(size, "reservation succeeded"),
            Err(e) => {
                println!("demo: reserving {size} bytes failed: {e}");
                return Ok(());
            }
        }
        size = size.checked_mul(2).context("no allocation failure before overflow")?;
    }
}

// Inside the unmapped zero page but not null, so debug builds do not turn the write into a panic.
const UNMAPPED_ADDRESS: usize = 0x8;

#[inline(never)]
unsafe fn deref_ptr(p: *mut u8) {
    *std::hint::black_box(p) = std::hint::black_box(1);
}

fn structured_fault() -> anyhow::Result<()> {
    // SAFETY: this is the fault being demonstrated.
    unsafe { deref_ptr(std::hint::black_box(UNMAPPED_ADDRESS) as *mut u8) };
    Ok(())
}
