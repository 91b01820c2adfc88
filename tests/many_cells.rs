use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use threadly::{State, ThreadLocal};

// Comfortably above PTHREAD_KEYS_MAX (1024 on glibc, 512 on macOS), so some
// of these cells have to live in the portable key table.
const CELLS: usize = 2048;

struct Count(Arc<AtomicUsize>, usize);

impl Drop for Count {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn more_cells_than_native_keys() {
    let drops = Arc::new(AtomicUsize::new(0));
    let cells: Vec<ThreadLocal<Count>> = (0..CELLS)
        .map(|i| {
            let drops = drops.clone();
            ThreadLocal::new(move || Count(drops.clone(), i))
        })
        .collect();

    let handle = {
        let cells = cells.clone();
        thread::spawn(move || {
            for (i, cell) in cells.iter().enumerate() {
                assert_eq!(cell.try_with(|v| v.1).unwrap(), i);
            }
            // every value is still alive and still the one first handed out
            for (i, cell) in cells.iter().enumerate() {
                assert_eq!(cell.state(), State::Initialized);
                assert_eq!(cell.with(|v| v.1), i);
            }
        })
    };
    handle.join().unwrap();

    assert_eq!(drops.load(Ordering::SeqCst), CELLS);
    assert!(cells.iter().all(|cell| cell.state() == State::Uninitialized));
}
