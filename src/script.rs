//! Script Bridge (component I, spec.md §4.I): an embedded `rhai`
//! interpreter exposing `sleep`/`send`/`expect`/line-control/transfer
//! primitives over the same device fd the interactive session uses.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use rhai::{Engine, EvalAltResult, Scope};

use crate::config::{LineMask, Options, Protocol};
use crate::device::Device;
use crate::error::ScriptError;
use crate::line::{self, PendingLineConfig};
use crate::session::{HotKey, RecvWindow};

struct ScriptContext {
    device: Device,
    opts: Options,
    pending: PendingLineConfig,
    hot_key: Arc<HotKey>,
    window: RecvWindow,
}

fn line_from_code(code: i64) -> Result<LineMask, Box<EvalAltResult>> {
    LineMask::from_digit(b'0' + code as u8)
        .ok_or_else(|| format!("invalid line code {code}").into())
}

fn protocol_from_code(code: i64) -> Result<Protocol, Box<EvalAltResult>> {
    Ok(match code {
        0 => Protocol::XmodemCrc,
        1 => Protocol::Xmodem1K,
        2 => Protocol::Ymodem,
        other => return Err(format!("invalid protocol code {other}").into()),
    })
}

/// Parse errors surface as `rhai::EvalAltResult::ErrorParsing`; every
/// other variant happened while the script was already executing.
fn classify_rhai_error(e: Box<EvalAltResult>) -> ScriptError {
    match *e {
        EvalAltResult::ErrorParsing(..) => ScriptError::Compile(e.to_string()),
        other => ScriptError::Runtime(other.to_string()),
    }
}

/// Runs `source` with `device` bound into the interpreter's globals.
/// Returns the device afterward so the caller can resume the
/// interactive session, unless the script called `exit()` (which
/// terminates the process directly, per spec.md §4.I). On a script
/// error the device is handed back alongside the error message so the
/// caller never loses the open, locked device fd.
pub fn run(
    source: &str,
    device: Device,
    opts: Options,
    hot_key: Arc<HotKey>,
) -> Result<Device, (Device, ScriptError)> {
    let ctx = Rc::new(RefCell::new(ScriptContext {
        device,
        opts,
        pending: PendingLineConfig::new(),
        hot_key,
        window: RecvWindow::new(),
    }));

    let mut engine = Engine::new();
    let mut scope = Scope::new();

    scope.push_constant("DTR", 0_i64);
    scope.push_constant("RTS", 1_i64);
    scope.push_constant("CTS", 2_i64);
    scope.push_constant("DSR", 3_i64);
    scope.push_constant("DCD", 4_i64);
    scope.push_constant("RI", 5_i64);
    scope.push_constant("XMODEM_CRC", 0_i64);
    scope.push_constant("XMODEM_1K", 1_i64);
    scope.push_constant("YMODEM", 2_i64);

    {
        let ctx = ctx.clone();
        engine.register_fn("sleep", move |seconds: f64| {
            let _ = &ctx;
            if seconds > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(seconds));
            }
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("msleep", move |ms: i64| {
            let _ = &ctx;
            if ms > 0 {
                std::thread::sleep(Duration::from_millis(ms as u64));
            }
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("high", move |line: i64| -> Result<(), Box<EvalAltResult>> {
            let mask = line_from_code(line)?;
            let mut c = ctx.borrow_mut();
            let fd = c.device.as_fd();
            line::set(fd, mask, true).map_err(|e| e.to_string().into())
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("low", move |line: i64| -> Result<(), Box<EvalAltResult>> {
            let mask = line_from_code(line)?;
            let mut c = ctx.borrow_mut();
            let fd = c.device.as_fd();
            line::set(fd, mask, false).map_err(|e| e.to_string().into())
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("toggle", move |line: i64| -> Result<(), Box<EvalAltResult>> {
            let mask = line_from_code(line)?;
            let mut c = ctx.borrow_mut();
            let fd = c.device.as_fd();
            line::toggle(fd, mask).map_err(|e| e.to_string().into())
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "config_high",
            move |line: i64| -> Result<(), Box<EvalAltResult>> {
                let mask = line_from_code(line)?;
                ctx.borrow_mut().pending.stage(mask, true);
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "config_low",
            move |line: i64| -> Result<(), Box<EvalAltResult>> {
                let mask = line_from_code(line)?;
                ctx.borrow_mut().pending.stage(mask, false);
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("config_apply", move || -> Result<(), Box<EvalAltResult>> {
            let mut c = ctx.borrow_mut();
            let ScriptContext { device, pending, .. } = &mut *c;
            let fd = device.as_fd();
            pending.apply(fd).map_err(|e| e.to_string().into())
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "modem_send",
            move |path: String, protocol: i64| -> Result<(), Box<EvalAltResult>> {
                let proto = protocol_from_code(protocol)?;
                let mut c = ctx.borrow_mut();
                let ScriptContext { device, hot_key, opts, .. } = &mut *c;
                crate::transfer::send_file(device, proto, &path, hot_key, opts.mute)
                    .map(|_| ())
                    .map_err(|e| e.to_string().into())
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("send", move |data: String| -> i64 {
            let mut c = ctx.borrow_mut();
            match c
                .device
                .write_bytes(data.as_bytes())
                .and_then(|_| c.device.sync())
            {
                Ok(()) => data.len() as i64,
                Err(_) => -1,
            }
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("expect", move |pattern: String, timeout_ms: i64| -> i64 {
            let re = match Regex::new(&pattern) {
                Ok(re) => re,
                Err(e) => {
                    let err = ScriptError::from(e);
                    tracing::warn!("{err}");
                    return -1;
                }
            };
            let mut c = ctx.borrow_mut();
            c.window.clear();
            let deadline = if timeout_ms == 0 {
                None
            } else {
                Some(Instant::now() + Duration::from_millis(timeout_ms.max(0) as u64))
            };
            loop {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return 0;
                    }
                }
                let mut buf = [0u8; 1];
                match c.device.read(&mut buf) {
                    Ok(1) => {
                        print!("{}", buf[0] as char);
                        c.window.push(buf[0]);
                        if re.is_match(&c.window.as_bytes()) {
                            return 1;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
            }
        });
    }
    engine.register_fn("exit", |code: i64| -> () {
        std::process::exit(code as i32);
    });

    let result = engine.run_with_scope(&mut scope, source).map_err(classify_rhai_error);
    // Drop the engine first: its registered closures each hold a clone
    // of `ctx`, and `try_unwrap` below needs the refcount back at 1.
    drop(engine);

    let ctx = Rc::try_unwrap(ctx)
        .unwrap_or_else(|_| unreachable!("engine dropped, no other Rc clones remain"))
        .into_inner();

    match result {
        Ok(()) => Ok(ctx.device),
        Err(e) => Err((ctx.device, e)),
    }
}
