mod common;

use chrono::{Duration, Utc};
use common::{harness, momo, signed_callback};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use revpay::domain::approval::{ApprovalStatus, Approver};
use revpay::domain::dead_letter::{DeadLetterAction, DeadLetterStatus};
use revpay::domain::gateway::GatewayResponse;
use revpay::domain::transaction::{PaymentTransaction, TransactionStatus};
use rust_decimal::Decimal;
use serde_json::json;

fn random_response(rng: &mut StdRng) -> GatewayResponse {
    match rng.gen_range(0..5) {
        0 => GatewayResponse::timeout(30),
        1 => GatewayResponse::failed("HTTP_502", "bad gateway"),
        2 => GatewayResponse::failed("DECLINED", "insufficient funds"),
        3 => GatewayResponse::pending(format!("OM-{}", rng.r#gen::<u32>())),
        _ => GatewayResponse::succeeded(format!("OM-{}", rng.r#gen::<u32>())),
    }
}

fn pick<'a>(rng: &mut StdRng, all: &'a [PaymentTransaction]) -> Option<&'a PaymentTransaction> {
    if all.is_empty() {
        None
    } else {
        Some(&all[rng.gen_range(0..all.len())])
    }
}

#[tokio::test]
async fn test_random_operations_preserve_invariants() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = harness();
        let orange = h.adapter("orange-money").clone();
        let afrimoney = h.adapter("afrimoney").clone();
        let mut now = Utc::now();

        for step in 0..150 {
            now += Duration::seconds(rng.gen_range(0..200));
            let all = h.processor.transactions().await.unwrap();
            match rng.gen_range(0..9) {
                0 | 1 => {
                    for adapter in [&orange, &afrimoney] {
                        if rng.gen_bool(0.7) {
                            adapter.push_response(random_response(&mut rng));
                        }
                    }
                    let amount = if rng.gen_bool(0.15) {
                        Decimal::new(rng.gen_range(50_000_000..150_000_000), 2)
                    } else {
                        Decimal::new(rng.gen_range(100..5_000_000), 2)
                    };
                    let client = format!("TIN-{}", rng.gen_range(0..6));
                    let _ = h.processor.create_transaction(momo(&client, amount), now).await;
                }
                2 => {
                    let _ = h.processor.run_due_retries(now).await;
                }
                3 => {
                    if let Some(tx) = pick(&mut rng, &all) {
                        let status = if rng.gen_bool(0.7) { "succeeded" } else { "failed" };
                        let (headers, body) = signed_callback(
                            "orange-money",
                            json!({
                                "event_type": format!("payment.{}", status),
                                "reference": tx.reference,
                                "provider_transaction_id": tx.provider_transaction_id,
                                "status": status
                            }),
                        );
                        let ack = h.processor.handle_webhook("orange-money", &headers, &body, now).await;
                        assert!(ack.is_ok(), "seed {} step {}: {:?}", seed, step, ack.err());
                    }
                }
                4 => {
                    if let Some(tx) = pick(&mut rng, &all) {
                        let _ = h.processor.cancel(tx.id, "cashier-2", "changed mind", now).await;
                    }
                }
                5 => {
                    for tx in all.iter().filter(|tx| tx.status == TransactionStatus::PendingApproval) {
                        for request in h.processor.approval_requests(tx.id).await.unwrap() {
                            if request.status != ApprovalStatus::Pending {
                                continue;
                            }
                            let Some(level) = request.current() else { continue };
                            let approver = Approver::new(format!("{}-1", level.role), &[level.role.as_str()]);
                            if rng.gen_bool(0.8) {
                                let _ = h.processor.approve(request.id, &approver, None, now).await;
                            } else {
                                let _ = h.processor.reject(request.id, &approver, "not verified", now).await;
                            }
                        }
                    }
                }
                6 => {
                    let pending = h.processor.dead_letters(Some(DeadLetterStatus::Pending)).await.unwrap();
                    if let Some(entry) = pending.first() {
                        let action = match rng.gen_range(0..3) {
                            0 => DeadLetterAction::Retry,
                            1 => DeadLetterAction::Resolve,
                            _ => DeadLetterAction::Discard,
                        };
                        let _ = h
                            .processor
                            .process_dead_letter(entry.id, action, "ops-1", None, now)
                            .await;
                    }
                }
                7 => {
                    if let Some(tx) = pick(&mut rng, &all) {
                        let _ = h.processor.refund(tx.id, "ops-1", now).await;
                    }
                }
                _ => {
                    if let Some(tx) = pick(&mut rng, &all) {
                        let _ = h.processor.reconcile(tx.id, now).await;
                    }
                }
            }
        }

        let _ = h.processor.expire_stale(now + Duration::days(2)).await.unwrap();
        check_invariants(&h.processor, seed).await;
    }
}

async fn check_invariants(processor: &revpay::application::processor::PaymentProcessor, seed: u64) {
    let gateways = processor.config().gateways.clone();
    let max_attempts = gateways.iter().map(|g| g.retry_attempts).max().unwrap_or(0);

    for tx in processor.transactions().await.unwrap() {
        let ctx = format!("seed {} tx {} ({})", seed, tx.reference, tx.status);
        assert_eq!(tx.net_amount, tx.amount - tx.fee, "{}", ctx);
        assert!(tx.retry_count <= max_attempts, "{}", ctx);

        let logs = processor.history(tx.id).await.unwrap();
        assert_eq!(logs[0].previous_status, None, "{}", ctx);
        assert_eq!(logs[0].new_status, TransactionStatus::Initiated, "{}", ctx);
        for pair in logs.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            assert_eq!(after.previous_status, Some(before.new_status), "{}", ctx);
            if before.new_status != after.new_status {
                assert!(
                    before.new_status.can_transition_to(after.new_status),
                    "{}: {} -> {}",
                    ctx,
                    before.new_status,
                    after.new_status
                );
            }
        }
        assert_eq!(logs.last().map(|l| l.new_status), Some(tx.status), "{}", ctx);
        for release in logs
            .iter()
            .filter(|l| l.previous_status == Some(TransactionStatus::DeadLettered) && l.new_status != TransactionStatus::DeadLettered)
        {
            assert_eq!(release.actor, "ops-1", "{}: left dead letter via {}", ctx, release.action);
        }

        let completions = logs
            .iter()
            .filter(|l| l.new_status == TransactionStatus::Completed && l.previous_status != Some(TransactionStatus::Completed))
            .count();
        let refund_declines = logs
            .iter()
            .filter(|l| l.previous_status == Some(TransactionStatus::RefundRequested) && l.new_status == TransactionStatus::Completed)
            .count();
        assert!(completions <= 1 + refund_declines, "{}", ctx);

        let pending_entries = processor
            .stores()
            .dead_letters
            .for_transaction(tx.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.status == DeadLetterStatus::Pending)
            .count();
        if tx.status == TransactionStatus::DeadLettered {
            assert_eq!(pending_entries, 1, "{}", ctx);
        } else {
            assert_eq!(pending_entries, 0, "{}", ctx);
        }

        if tx.status.is_final() || tx.status == TransactionStatus::Completed {
            assert_eq!(tx.next_retry_at, None, "{}", ctx);
        }
    }
}
