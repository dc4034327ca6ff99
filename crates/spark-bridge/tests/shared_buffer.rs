//! 共享写缓冲的性质验证。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：同一 worker 上任意多个会话以任意写出节奏消费同一份广播负载时，
//!   每个会话最终都写出完整负载，而主缓冲在任何一次刷写之后都保持原貌；
//! - **手法 (How)**：proptest 生成负载与每个会话每轮的写出预算（0 表示 `WouldBlock`），
//!   轮转刷写后检查主缓冲游标，最后放开预算收尾；
//! - **边界 (What)**：只覆盖单层 id；多层 id 的槽位隔离由单元测试覆盖。

use bytes::Bytes;
use proptest::collection::vec;
use proptest::prelude::*;
use spark_bridge::buffer::{LayerId, PendingWrite, SessionWriteState, WriteArena};
use spark_bridge::test_stubs::LimitedWriter;

const MAX_WRITE: usize = 16;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn every_sharer_writes_the_full_payload_and_master_stays_pristine(
        payload in vec(any::<u8>(), 1..256),
        plans in vec(vec(0usize..48, 1..6), 1..6),
        rounds in 1usize..8,
    ) {
        let payload = Bytes::from(payload);
        let layer = LayerId::new(2);
        let mut arena = WriteArena::new();
        let mut sessions: Vec<(SessionWriteState, LimitedWriter)> = plans
            .iter()
            .map(|_| {
                let mut state = SessionWriteState::new();
                state.enqueue(PendingWrite::Shared { layer, payload: payload.clone() });
                (state, LimitedWriter::new(0))
            })
            .collect();

        for round in 0..rounds {
            for ((state, writer), plan) in sessions.iter_mut().zip(&plans) {
                writer.set_budget(plan[round % plan.len()]);
                state.flush(&mut arena, writer, MAX_WRITE).expect("内存写端不会报错");
                let master = arena.master(layer).expect("首次刷写后主缓冲已安装");
                prop_assert_eq!(master.position(), 0);
                prop_assert_eq!(master.remaining(), payload.len());
            }
        }

        for (state, writer) in &mut sessions {
            writer.set_budget(usize::MAX);
            let outcome = state.flush(&mut arena, writer, MAX_WRITE).expect("收尾刷写");
            prop_assert!(!outcome.pending);
            prop_assert!(!state.has_pending());
            prop_assert_eq!(writer.output(), &payload[..]);
        }
        prop_assert_eq!(arena.installs(), 1, "同一负载只安装一次主缓冲");
    }

    #[test]
    fn private_writes_keep_their_order_around_shared_ones(
        first in vec(any::<u8>(), 1..64),
        shared in vec(any::<u8>(), 1..64),
        last in vec(any::<u8>(), 1..64),
        budget in 1usize..24,
    ) {
        let mut arena = WriteArena::new();
        let mut state = SessionWriteState::new();
        state.enqueue(PendingWrite::Private(Bytes::from(first.clone())));
        state.enqueue(PendingWrite::Shared { layer: LayerId::new(0), payload: Bytes::from(shared.clone()) });
        state.enqueue(PendingWrite::Private(Bytes::from(last.clone())));

        let mut writer = LimitedWriter::new(budget);
        let mut guard = 0;
        while state.has_pending() {
            writer.set_budget(budget);
            state.flush(&mut arena, &mut writer, MAX_WRITE).expect("内存写端不会报错");
            guard += 1;
            prop_assert!(guard < 10_000, "有限预算下刷写必须前进");
        }
        let expected: Vec<u8> = first.iter().chain(&shared).chain(&last).copied().collect();
        prop_assert_eq!(writer.output(), &expected[..]);
    }
}
