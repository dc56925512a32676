/// Observer for reporting progress of a cross-validated hyperparameter search.
///
/// Candidates are fitted on the rayon pool, so callbacks arrive from worker
/// threads and take `&self`.
pub trait SearchProgressObserver: Sync {
    fn on_search_start(&self, label: &str, total_candidates: usize) {
        let _ = (label, total_candidates);
    }
    fn on_candidate_finished(&self, label: &str) {
        let _ = label;
    }
    fn on_search_finish(&self, label: &str) {
        let _ = label;
    }
}

#[derive(Default)]
pub struct NoopSearchProgress;

impl SearchProgressObserver for NoopSearchProgress {}
