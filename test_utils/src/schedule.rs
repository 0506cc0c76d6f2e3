use agora_common::collaborators::ProducerSchedule;
use agora_common::ProducerId;

/// Fixed rotation through a list of producers
#[derive(Debug, Clone)]
pub struct RoundRobinSchedule {
    producers: Vec<ProducerId>,
}

impl RoundRobinSchedule {
    pub fn new(producers: Vec<ProducerId>) -> Self {
        Self { producers }
    }
}

impl ProducerSchedule for RoundRobinSchedule {
    fn upcoming(&self, current: &ProducerId, count: usize) -> Vec<ProducerId> {
        let Some(position) = self.producers.iter().position(|p| p == current) else {
            return self.producers.iter().take(count).copied().collect();
        };
        let len = self.producers.len();
        (1..len)
            .map(|offset| self.producers[(position + offset) % len])
            .take(count)
            .collect()
    }
}
