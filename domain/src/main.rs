use std::env;
use std::process;
use std::sync::Arc;

use domain::adapters::memory_repo::InMemoryStore;
use domain::adapters::notifier::TracingNotifier;
use domain::adapters::SystemClock;
use domain::clicks::ClickPolicy;
use domain::code::Base62CodeGenerator;
use domain::service::LinkService;
use domain::settlement::SettlementEngine;
use domain::{Money, NewLink, RequesterKey, RuleDraft, RuleKind, UserId, VisitSignals};

fn print_usage() {
    eprintln!(
        "{}\n\nUsage:\n  domain quote <cpm>\n  domain simulate <cpm> <visits> [--rules <n>] [--repeat <k>]\n\nNotes:\n  - simulate runs the full visit/settlement pipeline on an in-memory store;\n    every k-th visit reuses the previous requester to show dedup.",
        domain::about()
    );
}

fn parse_money(s: &str) -> Result<Money, String> {
    Money::parse(s).map_err(|e| format!("invalid amount {}: {}", s, e))
}

fn parse_count(s: Option<String>, what: &str) -> Result<usize, String> {
    let Some(s) = s else {
        return Err(format!("missing <{}>", what));
    };
    s.parse().map_err(|_| format!("invalid {}: {}", what, s))
}

fn simulate(cpm: Money, visits: usize, rule_count: usize, repeat: usize) -> Result<(), String> {
    let store = Arc::new(InMemoryStore::new());
    let engine = SettlementEngine::new(
        store.clone(),
        Arc::new(TracingNotifier),
        SystemClock,
        ClickPolicy::default(),
    );
    let links = LinkService::new(store, Base62CodeGenerator::new(6), SystemClock);
    let owner = UserId::new("demo-owner").map_err(|e| e.to_string())?;

    engine.rates().set_new_rate(cpm).map_err(|e| e.to_string())?;
    let rules = (0..rule_count)
        .map(|i| RuleDraft {
            kind: RuleKind::Follow,
            target_url: format!("https://social.example/{}", i),
        })
        .collect();
    let link = links
        .create(
            &owner,
            NewLink {
                destination: "https://example.com".into(),
                custom_code: None,
                title: None,
                description: None,
                rules,
            },
        )
        .map_err(|e| format!("create failed: {}", e))?;

    let mut billed = 0;
    for i in 0..visits {
        let n = if repeat > 0 && i > 0 && i % repeat == 0 { i - 1 } else { i };
        let signals = VisitSignals {
            requester_key: RequesterKey::new(format!("198.51.100.{}", n)),
            client_token: None,
            client_first_use: true,
        };
        let out = engine
            .settle_visit(&link.code, signals)
            .map_err(|e| format!("visit failed: {}", e))?;
        if out.billable {
            billed += 1;
        }
    }

    let link = links.get(&link.code).map_err(|e| e.to_string())?;
    println!(
        "link {} ({} rules, monetizable: {})",
        link.code.as_str(),
        link.rules.len(),
        link.monetizable
    );
    println!("visits: {}  billable: {}", link.total_clicks, billed);
    println!("earnings: {}", link.generated_earnings);
    Ok(())
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1); // skip program name

    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };

    match cmd.as_str() {
        "quote" => {
            let Some(cpm) = args.next() else {
                return Err("missing <cpm> for quote".into());
            };
            let cpm = parse_money(&cpm)?;
            println!("{} per billable visit", cpm.per_event());
            Ok(())
        }
        "simulate" => {
            let Some(cpm) = args.next() else {
                return Err("missing <cpm> for simulate".into());
            };
            let cpm = parse_money(&cpm)?;
            let visits = parse_count(args.next(), "visits")?;

            let mut rule_count = 3;
            let mut repeat = 0;
            let rest: Vec<String> = args.collect();
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--rules" => {
                        rule_count = parse_count(rest.get(i + 1).cloned(), "rules")?;
                        i += 2;
                    }
                    "--repeat" => {
                        repeat = parse_count(rest.get(i + 1).cloned(), "repeat")?;
                        i += 2;
                    }
                    unk => {
                        return Err(format!("unknown argument: {}", unk));
                    }
                }
            }
            simulate(cpm, visits, rule_count, repeat)
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn main() {
    if let Err(msg) = run() {
        eprintln!("error: {}", msg);
        process::exit(1);
    }
}
