// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal delivery, end to end: interrupted sleeps, priority nesting,
//! posting rules, handler management, and wait.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use userlib::{
    codes, sys_create, sys_kill, sys_sighandler, sys_sleep, sys_wait,
    sys_yield, Machine, Pid, Script, SIG_KILL,
};

/// A sleeper interrupted mid-sleep gets back roughly the time it had left.
#[test]
fn sleep_interrupted_by_signal_returns_remaining_time() {
    let mut m = Machine::new();
    m.set_timer_period(1); // every instruction is a tick
    let slept = Rc::new(Cell::new(i32::MIN));

    let handler = m.register(|| Script::new());
    let s = slept.clone();
    let sleeper = m.register(move || {
        let s = s.clone();
        Script::new()
            .op(move |ctx, _| sys_sighandler(5, handler, ctx.local(0)))
            .op(|_, _| sys_sleep(10_000))
            .op(move |_, r| {
                s.set(r);
                sys_yield()
            })
    });
    let killer = m.register(|| {
        Script::new().spin(300).op(|_, _| sys_kill(Pid(2), 5))
    });
    let root = m.register(move || {
        Script::new()
            .call(sys_create(sleeper, 0))
            .call(sys_create(killer, 0))
    });
    m.launch(root);
    m.run();

    // 10 000 ms is 1000 ticks; roughly 300 elapsed before the kill.
    let left = slept.get();
    assert_eq!(left % 10, 0, "remaining time is whole ticks");
    assert!(
        (6_800..=7_000).contains(&left),
        "remaining sleep was {left}, expected about 7000",
    );
}

/// A higher-numbered signal preempts a running handler; a lower-numbered
/// one waits for sigreturn. Afterwards the interrupted call's result is
/// restored.
#[test]
fn signal_priority_nests_high_over_low() {
    let mut m = Machine::new();
    let trace = Rc::new(RefCell::new(Vec::new()));

    let t = trace.clone();
    let high = m.register(move || {
        let t = t.clone();
        Script::new().op(move |_, _| {
            t.borrow_mut().push("high");
            sys_yield()
        })
    });
    let t = trace.clone();
    let low = m.register(move || {
        let t = t.clone();
        let t2 = t.clone();
        Script::new()
            .op(move |_, _| {
                t.borrow_mut().push("low-enter");
                sys_kill(Pid(1), 30)
            })
            .op(move |_, _| {
                t2.borrow_mut().push("low-exit");
                sys_yield()
            })
    });
    let t = trace.clone();
    let root = m.register(move || {
        let t = t.clone();
        Script::new()
            .op(move |ctx, _| sys_sighandler(1, low, ctx.local(0)))
            .op(move |ctx, _| sys_sighandler(30, high, ctx.local(0)))
            .op(|_, _| sys_kill(Pid(1), 1))
            .op(move |_, r| {
                t.borrow_mut().push("main");
                assert_eq!(r, 0, "pre-signal kill result is restored");
                sys_yield()
            })
    });
    m.launch(root);
    m.run();

    assert_eq!(*trace.borrow(), vec!["low-enter", "high", "low-exit", "main"]);
}

/// Posting a signal nobody handles is a successful no-op, and does not
/// wake a blocked target.
#[test]
fn unhandled_signal_is_ignored() {
    let mut m = Machine::new();
    m.set_timer_period(1);
    let woke_early = Rc::new(Cell::new(false));
    let kill_results = Rc::new(RefCell::new(Vec::new()));

    let w = woke_early.clone();
    let sleeper = m.register(move || {
        let w = w.clone();
        Script::new()
            .op(|_, _| sys_sleep(500))
            .op(move |_, r| {
                // An undisturbed sleep completes with 0.
                w.set(r != 0);
                sys_yield()
            })
    });
    let kr = kill_results.clone();
    let killer = m.register(move || {
        let kr = kr.clone();
        let kr2 = kr.clone();
        Script::new()
            .op(|_, _| sys_kill(Pid(2), 5))
            .op(move |_, r| {
                kr.borrow_mut().push(r);
                sys_kill(Pid(2), 5)
            })
            .op(move |_, r| {
                kr2.borrow_mut().push(r);
                sys_yield()
            })
    });
    let root = m.register(move || {
        Script::new()
            .call(sys_create(sleeper, 0))
            .call(sys_create(killer, 0))
    });
    m.launch(root);
    m.run();

    assert_eq!(*kill_results.borrow(), vec![0, 0], "ignored posts succeed");
    assert!(!woke_early.get(), "sleep ran to completion");
}

#[test]
fn kill_error_codes() {
    let mut m = Machine::new();
    let results = Rc::new(RefCell::new(Vec::new()));

    let r = results.clone();
    let root = m.register(move || {
        let r = r.clone();
        let r2 = r.clone();
        Script::new()
            .op(|_, _| sys_kill(Pid(77), 3))
            .op(move |_, res| {
                r.borrow_mut().push(res);
                sys_kill(Pid(1), 35)
            })
            .op(move |_, res| {
                r2.borrow_mut().push(res);
                sys_yield()
            })
    });
    m.launch(root);
    m.run();

    assert_eq!(
        *results.borrow(),
        vec![codes::KILL_NO_TARGET, codes::KILL_BAD_SIGNAL],
    );
}

/// Two posts of the same signal to a blocked target produce one delivery.
#[test]
fn duplicate_posts_deliver_once() {
    let mut m = Machine::new();
    m.set_timer_period(1);
    let runs = Rc::new(Cell::new(0));

    let r = runs.clone();
    let handler = m.register(move || {
        let r = r.clone();
        Script::new().op(move |_, _| {
            r.set(r.get() + 1);
            sys_yield()
        })
    });
    let sleeper = m.register(move || {
        Script::new()
            .op(move |ctx, _| sys_sighandler(9, handler, ctx.local(0)))
            .op(|_, _| sys_sleep(5_000))
            .op(|_, _| sys_yield())
    });
    let killer = m.register(|| {
        Script::new()
            .spin(50)
            .call(sys_kill(Pid(2), 9))
            .call(sys_kill(Pid(2), 9))
    });
    let root = m.register(move || {
        Script::new()
            .call(sys_create(sleeper, 0))
            .call(sys_create(killer, 0))
    });
    m.launch(root);
    m.run();

    assert_eq!(runs.get(), 1);
}

/// Signal 31 terminates even a blocked process, and cannot be overridden.
#[test]
fn kill_31_terminates() {
    let mut m = Machine::new();
    m.set_timer_period(1);
    let resumed = Rc::new(Cell::new(false));
    let handler_result = Rc::new(Cell::new(i32::MIN));

    let res = resumed.clone();
    let sleeper = m.register(move || {
        let res = res.clone();
        Script::new()
            .op(|_, _| sys_sleep(60_000))
            .op(move |_, _| {
                res.set(true);
                sys_yield()
            })
    });
    let hr = handler_result.clone();
    let killer = m.register(move || {
        let hr = hr.clone();
        let hr2 = hr.clone();
        Script::new()
            .spin(20)
            // The pinned slot rejects a handler change...
            .op(move |ctx, _| sys_sighandler(SIG_KILL, 0, ctx.local(0)))
            .op(move |_, r| {
                hr.set(r);
                // ...and the kill itself needs no registration.
                sys_kill(Pid(2), SIG_KILL)
            })
            .op(move |_, r| {
                hr2.set(r);
                sys_yield()
            })
    });
    let root = m.register(move || {
        Script::new()
            .call(sys_create(sleeper, 0))
            .call(sys_create(killer, 0))
    });
    m.launch(root);
    m.run();

    assert!(!resumed.get(), "terminated sleeper never resumed");
    assert_eq!(handler_result.get(), 0, "kill itself succeeded");
}

/// Installing a handler and installing back the old value round-trips.
#[test]
fn sighandler_round_trip() {
    let mut m = Machine::new();
    let observed = Rc::new(RefCell::new(Vec::new()));
    let handler_ran = Rc::new(Cell::new(false));

    let hr = handler_ran.clone();
    let handler = m.register(move || {
        let hr = hr.clone();
        Script::new().op(move |_, _| {
            hr.set(true);
            sys_yield()
        })
    });
    let o = observed.clone();
    let root = m.register(move || {
        let o = o.clone();
        let o2 = o.clone();
        Script::new()
            .op(move |ctx, _| sys_sighandler(5, handler, ctx.local(0)))
            .op(move |ctx, r| {
                assert_eq!(r, 0);
                o.borrow_mut().push(ctx.read_u32(ctx.local(0)));
                // Restore the original (disabled) disposition.
                sys_sighandler(5, 0, ctx.local(4))
            })
            .op(move |ctx, r| {
                assert_eq!(r, 0);
                o2.borrow_mut().push(ctx.read_u32(ctx.local(4)));
                sys_kill(Pid(1), 5)
            })
            .op(|_, _| sys_yield())
    });
    m.launch(root);
    m.run();

    assert_eq!(*observed.borrow(), vec![0, handler]);
    assert!(!handler_ran.get(), "disabled again, so the post was ignored");
}

#[test]
fn sighandler_argument_errors() {
    let mut m = Machine::new();
    let results = Rc::new(RefCell::new(Vec::new()));

    let r = results.clone();
    let root = m.register(move || {
        let r = r.clone();
        let push = move |v| r.borrow_mut().push(v);
        Script::new()
            .op(move |ctx, _| sys_sighandler(-1, 0, ctx.local(0)))
            .op({
                let push = push.clone();
                move |ctx, res| {
                    push(res);
                    sys_sighandler(SIG_KILL, 0, ctx.local(0))
                }
            })
            .op({
                let push = push.clone();
                move |ctx, res| {
                    push(res);
                    // A handler address outside memory entirely.
                    sys_sighandler(4, 0xFFFF_FFF0, ctx.local(0))
                }
            })
            .op({
                let push = push.clone();
                move |_, res| {
                    push(res);
                    // A bad old-handler pointer.
                    sys_sighandler(4, 0, 0)
                }
            })
            .op(move |_, res| {
                push(res);
                sys_yield()
            })
    });
    m.launch(root);
    m.run();

    assert_eq!(*results.borrow(), vec![-1, -1, -2, -3]);
}

/// wait blocks until the target stops, then reports 0; a signal cuts it
/// short with the interrupt code; self and missing targets fail.
#[test]
fn wait_outcomes() {
    let mut m = Machine::new();
    let outcome = Rc::new(Cell::new(i32::MIN));

    let o = outcome.clone();
    let waiter = m.register(move || {
        let o = o.clone();
        Script::new()
            .op(|_, _| sys_wait(Pid(3)))
            .op(move |_, r| {
                o.set(r);
                sys_yield()
            })
    });
    let target = m.register(|| Script::new().spin(40));
    let root = m.register(move || {
        Script::new()
            .call(sys_create(waiter, 0))
            .call(sys_create(target, 0))
    });
    m.launch(root);
    m.run();
    assert_eq!(outcome.get(), 0);
}

#[test]
fn wait_interrupted_by_signal() {
    let mut m = Machine::new();
    let outcome = Rc::new(Cell::new(i32::MIN));

    let handler = m.register(|| Script::new());
    let o = outcome.clone();
    let waiter = m.register(move || {
        let o = o.clone();
        Script::new()
            .op(move |ctx, _| sys_sighandler(2, handler, ctx.local(0)))
            .op(|_, _| sys_wait(Pid(3)))
            .op(move |_, r| {
                o.set(r);
                sys_yield()
            })
    });
    // The target outlives the test; only the signal ends the wait.
    let target = m.register(|| {
        Script::new().call(sys_kill(Pid(2), 2)).spin(10)
    });
    let root = m.register(move || {
        Script::new()
            .call(sys_create(waiter, 0))
            .call(sys_create(target, 0))
    });
    m.launch(root);
    m.run();
    assert_eq!(outcome.get(), codes::INTERRUPTED);
}

#[test]
fn wait_rejects_self_and_missing() {
    let mut m = Machine::new();
    let results = Rc::new(RefCell::new(Vec::new()));

    let r = results.clone();
    let root = m.register(move || {
        let r = r.clone();
        let r2 = r.clone();
        Script::new()
            .op(|_, _| sys_wait(Pid(1)))
            .op(move |_, res| {
                r.borrow_mut().push(res);
                sys_wait(Pid(50))
            })
            .op(move |_, res| {
                r2.borrow_mut().push(res);
                sys_yield()
            })
    });
    m.launch(root);
    m.run();

    assert_eq!(*results.borrow(), vec![codes::SYSERR, codes::SYSERR]);
}
