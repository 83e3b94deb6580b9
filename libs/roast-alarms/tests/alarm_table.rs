//! Alarm tables loaded from disk and run over a short roast
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use roast_alarms::{
    parse_commands, ActionKind, AlarmEngine, AlarmTable, Command, RoastEvent, RoastEvents, Sample,
};
use std::io::Write;
use tracing_test::traced_test;

const TABLE_CSV: &str = "\
nr,status,if_alarm,but_not,from_event,time_offset,source,condition,temperature,action,description
1,true,0,0,CHARGE,30,BT,below,100,pop_up,Turning point reached
2,true,1,0,START,0,BT,above,150,command,\"write(1,4,60);slider(1,60)\"
3,true,0,4,FCs,0,dFCs,above,60,drop,
4,false,0,0,START,0,ET,above,500,pop_up,Too hot
";

fn sample(time: f64, et: f64, bt: f64) -> Sample {
    Sample::new(time).with("ET", Some(et)).with("BT", Some(bt))
}

#[test]
fn test_load_csv_and_json_files() {
    let mut csv_file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    csv_file.write_all(TABLE_CSV.as_bytes()).unwrap();
    let table = AlarmTable::load(csv_file.path()).unwrap();
    assert_eq!(table.len(), 4);
    assert_eq!(table.rules()[2].row.action, ActionKind::Drop);
    assert_eq!(table.rules()[2].row.description, "");

    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("alarms.json");
    table.save(&json_path).unwrap();
    assert_eq!(AlarmTable::load(&json_path).unwrap(), table);

    let csv_path = dir.path().join("copy.csv");
    table.save(&csv_path).unwrap();
    assert_eq!(AlarmTable::load(&csv_path).unwrap(), table);
}

#[traced_test]
#[test]
fn test_roast_run() {
    let table = AlarmTable::from_csv_reader(TABLE_CSV.as_bytes()).unwrap();
    let mut engine = AlarmEngine::new(table);
    let mut events = RoastEvents::new();
    let mut fired = Vec::new();

    events.mark(RoastEvent::Charge, 0.0);
    for (time, et, bt) in [
        (10.0, 230.0, 95.0),
        (40.0, 220.0, 92.0),
        (200.0, 240.0, 151.0),
        (480.0, 250.0, 196.0),
        (541.0, 255.0, 205.0),
    ] {
        if time == 480.0 {
            events.mark(RoastEvent::FcStart, time);
        }
        for trigger in engine.evaluate(&sample(time, et, bt), &events) {
            fired.push((trigger.nr, time));
            if trigger.action == ActionKind::Command {
                let commands = parse_commands(&trigger.payload).unwrap();
                assert_eq!(commands.len(), 2);
                assert!(matches!(commands[1], Command::Slider { slider: 1, .. }));
            }
        }
    }

    // Rule 1 waits 30 s after CHARGE; rule 4 is disabled
    assert_eq!(fired, vec![(1, 40.0), (2, 200.0), (3, 541.0)]);
    assert!(logs_contain("Alarm 3 triggered"));

    engine.reset();
    assert!(engine.table().rules().iter().all(|rule| !rule.fired));
}
