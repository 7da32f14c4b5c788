#[allow(unused_imports)]
mod integration;
