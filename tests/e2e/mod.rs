//! 端到端测试模块
//!
//! 测试完整的业务流程和场景

#[allow(unused_imports)]
mod free_tier_journey;
#[allow(unused_imports)]
mod plan_expiry;
#[allow(unused_imports)]
mod storage_outage;
