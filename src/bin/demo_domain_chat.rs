// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Demo of the Domain/Context/Subscriber pub/sub API, in the spirit of
// demo_chat.rs but exercising the type-tagged transport instead of the
// raw byte channel.
//
// Usage: demo_domain_chat   (run multiple instances in separate terminals)
//
// Every instance admits one ChatLine subscriber to its own in-process
// Domain and publishes typed CHAT_LINE envelopes; since this demo runs a
// single Domain per process with no IPC attached, only subscribers within
// the same process see each other's messages. Type a line and press
// Enter to publish it. Type "q" to quit.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tips_core::context::Subscriber;
use tips_core::dispatch::{DispatchEntry, DispatchOutcome, DispatchTable, Interest, StopReason};
use tips_core::{Domain, SendMask, ShmHandle, ShmOpenMode, TipsConfig, TypeTag};

const CHAT_LINE: TypeTag = 1000;
const QUIT: &str = "q";

fn calc_unique_id() -> u64 {
    let shm = ShmHandle::acquire(
        "__DOMAIN_CHAT_ACC_STORAGE__",
        std::mem::size_of::<AtomicU64>(),
        ShmOpenMode::CreateOrOpen,
    )
    .expect("shm acquire");
    let counter = unsafe { &*(shm.get() as *const AtomicU64) };
    counter.fetch_add(1, Ordering::Relaxed)
}

struct ChatLine {
    id: String,
    table: DispatchTable,
}

impl ChatLine {
    fn new(id: String) -> Self {
        let table = DispatchTable::new(
            vec![DispatchEntry {
                interest: Interest::Fixed(CHAT_LINE),
                index: 0,
            }],
            false,
        );
        Self { id, table }
    }
}

impl Subscriber<256> for ChatLine {
    fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    fn on_message(&mut self, _index: usize, payload: &[u8]) -> DispatchOutcome {
        let text = String::from_utf8_lossy(payload);
        if let Some((from_id, msg)) = text.split_once("> ") {
            if from_id == self.id {
                return if msg == QUIT {
                    DispatchOutcome::Stop(StopReason::ExplicitExit(0))
                } else {
                    DispatchOutcome::Continue // skip own messages
                };
            }
        }
        println!("{text}");
        DispatchOutcome::Continue
    }

    fn name(&self) -> &str {
        "chat_line"
    }
}

fn main() {
    let id = format!("c{}", calc_unique_id());

    let domain: Arc<Mutex<Domain<256>>> = Arc::new(Mutex::new(Domain::new(TipsConfig::default())));
    if domain
        .lock()
        .unwrap()
        .local_context_mut()
        .admit(Box::new(ChatLine::new(id.clone())))
        .is_err()
    {
        panic!("no free consumer slot for chat subscriber");
    }

    println!("{id} is ready.");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.trim().is_empty() {
            break;
        }
        let trimmed = line.trim();
        let guard = domain.lock().unwrap();
        if trimmed == QUIT {
            guard.publish(CHAT_LINE, format!("{id}> {QUIT}").as_bytes(), SendMask::default());
            drop(guard);
            break;
        }
        guard.publish(CHAT_LINE, format!("{id}> {trimmed}").as_bytes(), SendMask::default());
    }

    domain.lock().unwrap().stop();
    domain.lock().unwrap().join();
    println!("{id} is quit...");
}
