// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendezvous IPC, end to end: both rendezvous orders, receive-any
//! draining, and the documented error codes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use userlib::{
    codes, sys_create, sys_getpid, sys_recv, sys_send, sys_yield, Machine,
    Pid, Script,
};

#[test]
fn send_then_recv() {
    let mut m = Machine::new();
    let send_result = Rc::new(Cell::new(i32::MIN));
    let got = Rc::new(Cell::new((i32::MIN, 0u32)));

    // Root is PID 1, so the two children get PIDs 2 and 3.
    let sr = send_result.clone();
    let sender = m.register(move || {
        let sr = sr.clone();
        Script::new()
            .op(|_, _| sys_send(Pid(3), 42))
            .op(move |_, r| {
                sr.set(r);
                sys_yield()
            })
    });
    let g = got.clone();
    let receiver = m.register(move || {
        let g = g.clone();
        Script::new()
            .op(|ctx, _| {
                ctx.write_u32(ctx.local(0), 2); // receive from the sender only
                sys_recv(ctx.local(0), ctx.local(4))
            })
            .op(move |ctx, r| {
                g.set((r, ctx.read_u32(ctx.local(4))));
                sys_yield()
            })
    });
    let root = m.register(move || {
        Script::new()
            .call(sys_create(sender, 0))
            .call(sys_create(receiver, 0))
    });
    m.launch(root);
    m.run();

    assert_eq!(send_result.get(), 0);
    assert_eq!(got.get(), (0, 42));
}

#[test]
fn recv_then_send() {
    let mut m = Machine::new();
    let got = Rc::new(Cell::new((i32::MIN, 0u32)));

    let g = got.clone();
    let receiver = m.register(move || {
        let g = g.clone();
        Script::new()
            .op(|ctx, _| {
                ctx.write_u32(ctx.local(0), 3);
                sys_recv(ctx.local(0), ctx.local(4))
            })
            .op(move |ctx, r| {
                g.set((r, ctx.read_u32(ctx.local(4))));
                sys_yield()
            })
    });
    let sender = m.register(|| Script::new().call(sys_send(Pid(2), 7)));
    let root = m.register(move || {
        Script::new()
            .call(sys_create(receiver, 0))
            .call(sys_create(sender, 0))
    });
    m.launch(root);
    m.run();

    assert_eq!(got.get(), (0, 7));
}

#[test]
fn receive_any_drains_senders_in_fifo_order() {
    const SENDERS: i32 = 10;
    let mut m = Machine::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    // The receiver is created first (PID 2); it yields once so every
    // sender can park on its queue, then drains them all.
    let o = order.clone();
    let receiver = m.register(move || {
        let o = o.clone();
        let mut s = Script::new().call(sys_yield());
        for i in 0..SENDERS {
            let o = o.clone();
            s = s.op(move |ctx, r| {
                if i > 0 {
                    assert_eq!(r, 0);
                    o.borrow_mut().push(ctx.read_u32(ctx.local(0)));
                }
                ctx.write_u32(ctx.local(0), 0); // anyone
                sys_recv(ctx.local(0), ctx.local(4))
            });
        }
        let o = o.clone();
        s.op(move |ctx, r| {
            assert_eq!(r, 0);
            o.borrow_mut().push(ctx.read_u32(ctx.local(0)));
            sys_yield()
        })
    });
    let sender = m.register(|| {
        Script::new()
            .call(sys_getpid())
            .op(|_, me| sys_send(Pid(2), me as u32))
    });
    let root = m.register(move || {
        let mut s = Script::new().call(sys_create(receiver, 0));
        for _ in 0..SENDERS {
            s = s.call(sys_create(sender, 0));
        }
        s
    });
    m.launch(root);
    m.run();

    let expect: Vec<u32> = (3..3 + SENDERS as u32).collect();
    assert_eq!(*order.borrow(), expect);
}

#[test]
fn self_and_missing_targets() {
    let mut m = Machine::new();
    let results = Rc::new(RefCell::new(Vec::new()));

    let r = results.clone();
    let root = m.register(move || {
        let r = r.clone();
        let r2 = r.clone();
        let r3 = r.clone();
        Script::new()
            .op(|_, _| sys_send(Pid(1), 9)) // to myself
            .op(move |_, res| {
                r.borrow_mut().push(res);
                sys_send(Pid(99), 9) // to nobody
            })
            .op(move |ctx, res| {
                r2.borrow_mut().push(res);
                ctx.write_u32(ctx.local(0), 1); // receive from myself
                sys_recv(ctx.local(0), ctx.local(4))
            })
            .op(move |_, res| {
                r3.borrow_mut().push(res);
                sys_yield()
            })
    });
    m.launch(root);
    m.run();

    assert_eq!(
        *results.borrow(),
        vec![
            codes::SELF_TARGET,
            codes::NO_SUCH_PROCESS,
            codes::SELF_TARGET,
        ],
    );
}

#[test]
fn recv_validates_its_pointers() {
    let mut m = Machine::new();
    let results = Rc::new(RefCell::new(Vec::new()));

    let r = results.clone();
    let root = m.register(move || {
        let r = r.clone();
        let r2 = r.clone();
        Script::new()
            // A null `from` pointer is rejected first.
            .op(|ctx, _| sys_recv(0, ctx.local(4)))
            .op(move |ctx, res| {
                r.borrow_mut().push(res);
                // A data buffer inside kernel memory is no buffer at all.
                ctx.write_u32(ctx.local(0), 0);
                sys_recv(ctx.local(0), 0x100)
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
        vec![codes::BAD_FROM_PTR, codes::BAD_BUFFER],
    );
}

#[test]
fn sender_sees_peer_death() {
    let mut m = Machine::new();
    let send_result = Rc::new(Cell::new(i32::MIN));

    let sr = send_result.clone();
    let sender = m.register(move || {
        let sr = sr.clone();
        Script::new()
            .op(|_, _| sys_send(Pid(3), 1))
            .op(move |_, r| {
                sr.set(r);
                sys_yield()
            })
    });
    // The victim stops without ever receiving.
    let victim = m.register(|| Script::new());
    let root = m.register(move || {
        Script::new()
            .call(sys_create(sender, 0))
            .call(sys_create(victim, 0))
    });
    m.launch(root);
    m.run();

    assert_eq!(send_result.get(), codes::SYSERR);
}

#[test]
fn lone_receive_any_reports_deadlock_immediately() {
    let mut m = Machine::new();
    let result = Rc::new(Cell::new(i32::MIN));

    let res = result.clone();
    let root = m.register(move || {
        let res = res.clone();
        Script::new()
            .op(|ctx, _| {
                ctx.write_u32(ctx.local(0), 0);
                sys_recv(ctx.local(0), ctx.local(4))
            })
            .op(move |_, r| {
                res.set(r);
                sys_yield()
            })
    });
    m.launch(root);
    m.run();

    assert_eq!(result.get(), codes::LAST_PROCESS);
}

#[test]
fn receive_any_blocker_wakes_when_last_peer_dies() {
    let mut m = Machine::new();
    let result = Rc::new(Cell::new(i32::MIN));

    let res = result.clone();
    let receiver = m.register(move || {
        let res = res.clone();
        Script::new()
            .op(|ctx, _| {
                ctx.write_u32(ctx.local(0), 0);
                sys_recv(ctx.local(0), ctx.local(4))
            })
            .op(move |_, r| {
                res.set(r);
                sys_yield()
            })
    });
    // This process exists just long enough for the receive to block.
    let bystander = m.register(|| Script::new().call(sys_yield()));
    let root = m.register(move || {
        Script::new()
            .call(sys_create(receiver, 0))
            .call(sys_create(bystander, 0))
    });
    m.launch(root);
    m.run();

    assert_eq!(result.get(), codes::LAST_PROCESS);
}
