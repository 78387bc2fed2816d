use tbsched::prelude::*;

// A clocked design with a D flip-flop modelled as a task.
fn dut() -> MemSim {
    let mut sim = MemSim::new();
    let clk = sim.add_signal("dut.clk", 0);
    sim.add_signal("dut.d", 0);
    sim.add_signal("dut.q", 0);
    sim.add_clock(clk, 10);
    sim.with_horizon(1_000_000)
}

async fn test_ten_edges(sim: Sim) -> TaskResult {
    let clk = sim.signal("dut.clk")?;
    for i in 1..=10 {
        clk.rising_edge().await;
        sim.log(&format!("rising edge {} of 10", i));
    }
    Ok(Val::None)
}

async fn dff_model(clk: SimObject, d: SimObject, q: SimObject) -> TaskResult {
    loop {
        clk.rising_edge().await;
        q.set(d.u64()?)?;
    }
}

async fn test_dff(sim: Sim) -> TaskResult {
    let clk = sim.signal("dut.clk")?;
    let d = sim.signal("dut.d")?;
    let q = sim.signal("dut.q")?;
    sim.fork(dff_model(clk.clone(), d.clone(), q.clone()));

    let sb = Scoreboard::new();
    for _ in 0..1000 {
        let val = sim.rand_int(2) as u64;
        d.set(val)?;
        sb.add_exp(val);
        clk.rising_edge().await;
        // let the model update q
        sim.timer_steps(1).await;
        sb.add_recv(q.u64()?);
    }
    sb.result()
}

tbsched::run_tests!(dut(); test_ten_edges, test_dff);
