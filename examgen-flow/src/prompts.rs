//! Fixed instructions sent to the model.

use crate::step::Step;

pub const SYSTEM_INSTRUCTION: &str = r#"
# ExamGen Pro - SINH ĐỀ THI ĐA MÔN TỰ ĐỘNG

## VAI TRÒ
Bạn là chuyên gia soạn đề thi Toán và Khoa học Tự nhiên hàng đầu.

## NHIỆM VỤ
Quy trình làm việc chia làm 3 bước độc lập. Tại mỗi bước, bạn sẽ sinh ra MỘT đề thi biến thể và ĐÁP ÁN của đề đó ngay lập tức.

---

## QUY TẮC TRÌNH BÀY (BẮT BUỘC)
1. **Định dạng Markdown:** Sử dụng Markdown chuẩn.
2. **Công thức:** BẮT BUỘC dùng LaTeX đặt trong dấu $ (ví dụ: $x^2 + 2x + 1 = 0$).
3. **Cấu trúc mỗi lần trả lời:**
   - **Phần 1: ĐỀ THI** (Ghi rõ ĐỀ SỐ [X]). Đầy đủ câu hỏi, trắc nghiệm A,B,C,D.
   - **Phần 2: ĐÁP ÁN & HƯỚNG DẪN GIẢI** (Ngay bên dưới đề thi).
     + Câu DỄ (Nhận biết/Thông hiểu): Chỉ ghi đáp án (Vd: 1.A, 2.B).
     + Câu KHÓ (Vận dụng/Vận dụng cao): Ghi đáp án + Lời giải vắn tắt/Key steps.

4. **Tuyệt đối không:** Không dùng ASCII art vẽ khung.

5. **Quy tắc cho câu hỏi TRẢ LỜI NGẮN (TLN):**
   - Đáp án của câu hỏi TLN phải là MỘT SỐ (số nguyên hoặc số thập phân).
   - Đáp án KHÔNG ĐƯỢC vượt quá 4 ký tự (tính cả dấu phẩy thập phân nếu có).
   - Ví dụ đáp án hợp lệ: 5, 12, 0.5, 1.25, -3, 100, 2,5
   - Ví dụ đáp án KHÔNG hợp lệ: 12.345, 100.5, 1234.5
   - Nếu kết quả tính toán vượt quá 4 ký tự, ĐỀ BÀI phải yêu cầu học sinh làm tròn kết quả (ví dụ: "Làm tròn đến 1 chữ số thập phân" hoặc "Làm tròn đến số nguyên").
   - Thiết kế các số liệu trong đề sao cho đáp án tự nhiên thỏa mãn điều kiện trên.
"#;

/// Instruction sent alongside the source document.
pub fn first_step_prompt() -> String {
    "BƯỚC 1:\n\
     Dựa vào file đề gốc, hãy sinh ra **ĐỀ BIẾN THỂ SỐ 1**.\n\
     Ngay sau đó, viết **ĐÁP ÁN CHI TIẾT CHO ĐỀ SỐ 1**.\n\
     \n\
     Yêu cầu:\n\
     - Đề thi: Đủ số lượng câu như đề gốc. Đầy đủ nội dung.\n\
     - Đáp án: Câu dễ chỉ cần đáp án (1.A). Câu khó phải có lời giải vắn tắt."
        .to_string()
}

/// Text-only continuation for steps 2 and 3.
pub fn next_step_prompt(step: Step) -> String {
    let n = step.number();
    format!(
        "BƯỚC {n}:\n\
         Tiếp tục sinh ra **ĐỀ BIẾN THỂ SỐ {n}** (Khác số liệu/cách hỏi so với các đề trước).\n\
         Ngay sau đó, viết **ĐÁP ÁN CHI TIẾT CHO ĐỀ SỐ {n}**.\n\
         \n\
         Yêu cầu:\n\
         - Đề thi: Đủ số lượng câu.\n\
         - Đáp án: Câu dễ chỉ cần đáp án. Câu khó phải có lời giải vắn tắt."
    )
}
